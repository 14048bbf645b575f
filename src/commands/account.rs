//! Session management commands.
//!
//! These talk to the identity endpoint through a [`SessionStore`] without
//! starting the push channel.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};
use zeroize::Zeroizing;

use crate::auth::{AuthError, HttpIdentityApi, SignupRequest, UserProfile};
use crate::config::Config;
use crate::keyring::TokenStore;
use crate::session::SessionStore;

/// Environment variable that supplies the password non-interactively.
pub const PASSWORD_ENV_VAR: &str = "HR_PORTAL_PASSWORD";

fn session_store(config: &Config, storage: Arc<dyn TokenStore>) -> Result<SessionStore> {
    let identity = HttpIdentityApi::new(&config.api_base_url, config.request_timeout())?;
    Ok(SessionStore::new(Arc::new(identity), storage))
}

/// Read the password from `HR_PORTAL_PASSWORD`, or the first line of stdin.
pub fn read_password() -> Result<Zeroizing<String>> {
    if let Ok(password) = std::env::var(PASSWORD_ENV_VAR) {
        return Ok(Zeroizing::new(password));
    }
    eprint!("Password: ");
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        anyhow::bail!("No password given (set {PASSWORD_ENV_VAR} or pipe it on stdin)");
    }
    Ok(Zeroizing::new(password.to_string()))
}

fn describe(profile: &UserProfile) -> String {
    let mut line = format!("{} <{}> (id {})", profile.display_name(), profile.email, profile.id);
    if !profile.role.is_empty() {
        line.push_str(&format!(", {}", profile.role));
    }
    if !profile.department.is_empty() {
        line.push_str(&format!(", {}", profile.department));
    }
    line
}

/// Log in and store the session token.
pub async fn login(
    config: &Config,
    storage: Arc<dyn TokenStore>,
    email: &str,
    password: &str,
) -> Result<()> {
    let session = session_store(config, storage)?;
    match session.login(email, password).await {
        Ok(profile) => {
            println!("Logged in as {}", describe(&profile));
            Ok(())
        }
        Err(AuthError::InvalidCredentials) => anyhow::bail!("Invalid email or password"),
        Err(e) => Err(e).context("Login failed"),
    }
}

/// Create an account and store its session token.
pub async fn signup(config: &Config, storage: Arc<dyn TokenStore>, request: &SignupRequest) -> Result<()> {
    let session = session_store(config, storage)?;
    match session.signup(request).await {
        Ok(profile) => {
            println!("Account created. Logged in as {}", describe(&profile));
            Ok(())
        }
        Err(AuthError::InvalidCredentials) => anyhow::bail!("Signup rejected by the server"),
        Err(e) => Err(e).context("Signup failed"),
    }
}

/// Forget the stored session token.
pub fn logout(config: &Config, storage: Arc<dyn TokenStore>) -> Result<()> {
    let session = session_store(config, storage)?;
    session.logout();
    println!("Logged out");
    Ok(())
}

/// Validate the stored token and print the profile it belongs to.
pub async fn whoami(config: &Config, storage: Arc<dyn TokenStore>) -> Result<()> {
    let session = session_store(config, storage)?;
    if !session.is_authenticated() {
        println!("Not logged in");
        return Ok(());
    }
    match session.validate().await {
        Ok(profile) => {
            println!("{}", describe(&profile));
            Ok(())
        }
        Err(AuthError::Unauthorized) => {
            println!("Session expired; log in again");
            Ok(())
        }
        Err(e) => Err(e).context("Could not reach the identity service"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_includes_role_and_department() {
        let profile = UserProfile {
            id: 4,
            uuid: String::new(),
            first_name: "Grace".to_string(),
            last_name: "Hopper".to_string(),
            email: "grace@example.com".to_string(),
            department: "Engineering".to_string(),
            position: "Admiral".to_string(),
            role: "manager".to_string(),
        };
        assert_eq!(
            describe(&profile),
            "Grace Hopper <grace@example.com> (id 4), manager, Engineering"
        );
    }

    #[test]
    fn describe_skips_empty_fields() {
        let profile = UserProfile {
            id: 5,
            uuid: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            email: "x@example.com".to_string(),
            department: String::new(),
            position: String::new(),
            role: String::new(),
        };
        assert_eq!(describe(&profile), "x@example.com <x@example.com> (id 5)");
    }
}
