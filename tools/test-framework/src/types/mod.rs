/*!
   Data types used by the engine and exposed to test scenarios.
*/

pub mod config;
pub mod context;
pub mod env;
pub mod token;
pub mod wallet;
