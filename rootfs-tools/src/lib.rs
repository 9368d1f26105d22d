pub mod io;
pub mod xattr;
