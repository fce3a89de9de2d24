pub mod discover;
pub mod excel_read;
pub mod xml_doc;
pub mod xml_write;
