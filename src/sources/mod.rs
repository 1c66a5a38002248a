pub mod authenticator;
pub mod discovery;
pub mod download;
pub mod export;
pub mod manifest;
pub mod request;
pub mod signer;
