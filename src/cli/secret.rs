//! `tollgate secret`

use tollgate::auth::generate_secret;

/// Print a new admin secret for `TOLLGATE_ADMIN_SECRET`.
pub fn cmd_secret() {
    println!("{}", generate_secret());
}
