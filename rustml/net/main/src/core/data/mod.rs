pub mod memory;
pub mod mmap;
pub mod spans;
pub mod tensor_file;
pub mod tokens;
