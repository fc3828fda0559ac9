pub mod array;
pub mod disk;
pub mod volume;
