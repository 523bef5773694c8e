pub mod extendible;

pub use extendible::ExtendibleHashTable;
