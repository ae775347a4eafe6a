/*!
   Framework code for running a test case from start to finish, and
   for tearing down everything it created.
*/

pub mod base;
pub mod supervisor;
