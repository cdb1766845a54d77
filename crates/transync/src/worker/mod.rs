pub mod scanner;

pub use scanner::DirectoryScanner;
