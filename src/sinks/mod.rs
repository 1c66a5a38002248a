pub mod ndjson_file;
