pub mod data_file;
pub mod file_collection;
pub mod file_header;
pub mod key_index;
pub mod trlog;
pub mod value_descriptor;
