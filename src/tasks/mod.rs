//! Scripted workflows built on top of the session pool.

mod share;

pub use share::{Credentials, ShareTask, ShareTaskConfig, TaskReport};

/// CSS selectors for the target site's login and share surfaces.
pub mod selectors {
    pub const LOGIN_EMAIL: &str = "input[name='login_form[username_email]']";
    pub const LOGIN_PASSWORD: &str = "input[name='login_form[password]']";
    pub const LOGIN_SUBMIT: &str = "button[type='submit']";
    pub const LOGGED_IN_MARKER: &str = "[data-test='user-profile-dropdown']";
    pub const CAPTCHA_CHALLENGE: &str = "iframe[src*='captcha']";
    pub const SHARE_BUTTON: &str = "[data-test='share-listing']";
    pub const SHARE_TO_FOLLOWERS: &str = "[data-test='share-followers']";
}
