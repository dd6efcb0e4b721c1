pub mod cookie_store;
pub mod input_validation;
pub mod netscape;

pub use cookie_store::{CookieStatus, CookieStore};
pub use input_validation::InputValidator;
