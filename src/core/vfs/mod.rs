//! Virtual file: the ordered fragment map of one decomposed container
//!
//! Fragments are kept sorted by path. Numbered names sort in emission order,
//! so the map order mirrors the byte order of the container and modules can
//! rely on it when walking neighbours.
//!
//! The working directory is the durable copy; this map is a cache that can
//! always be rebuilt from a directory listing.

mod virtual_file;


pub use virtual_file::VirtualFile;
