/*!
   Process-wide setup run at the beginning of a test session.

   Test authors normally reach this through
   [`run_interchain_test`](crate::framework::base::run_interchain_test).
*/

pub mod init;
