/*!
   All test cases are placed within this module.

   We expose the modules as public so that cargo doc
   will pick up the definition by default.
*/

#[cfg(any(doc, feature = "docker"))]
pub mod cleanup;



#[cfg(any(doc, feature = "docker"))]
pub mod interchain_security;


#[cfg(any(doc, feature = "docker"))]
pub mod thorchain;
