/*!
   Utility functions that are used by the framework.
*/

pub mod assert;
pub mod block_db;
pub mod file;
pub mod json;
pub mod progress;
pub mod random;
pub mod retry;
