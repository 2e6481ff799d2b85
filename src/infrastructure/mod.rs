pub mod echo;
pub mod worker;
