//! Command parsing and execution.

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use partsdesk_core::api::{ApiClient, ApiError, Method, OutgoingRequest};
use partsdesk_core::{Config, Credentials, Session, SessionEvent};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, PartialEq)]
pub enum Command {
    Login { email: Option<String> },
    Logout,
    Status,
    Request {
        method: Method,
        path: String,
        body: Option<Value>,
    },
    Help,
}

impl Command {
    pub fn parse(args: &[String]) -> Result<Self> {
        let Some((name, rest)) = args.split_first() else {
            return Ok(Command::Help);
        };

        match (name.as_str(), rest) {
            ("help" | "-h" | "--help", _) => Ok(Command::Help),
            ("login", []) => Ok(Command::Login { email: None }),
            ("login", [email]) => Ok(Command::Login {
                email: Some(email.clone()),
            }),
            ("logout", []) => Ok(Command::Logout),
            ("status", []) => Ok(Command::Status),
            ("get", [path]) => Ok(Command::Request {
                method: Method::GET,
                path: path.clone(),
                body: None,
            }),
            ("request", [method, path, body @ ..]) if body.len() <= 1 => {
                let method = Method::from_bytes(method.to_uppercase().as_bytes())
                    .with_context(|| format!("Invalid HTTP method {:?}", method))?;
                let body = body
                    .first()
                    .map(|raw| serde_json::from_str(raw).context("Request body must be valid JSON"))
                    .transpose()?;
                Ok(Command::Request {
                    method,
                    path: path.clone(),
                    body,
                })
            }
            ("login" | "logout" | "status" | "get" | "request", _) => {
                bail!("Wrong number of arguments for '{}'", name)
            }
            _ => bail!("Unknown command '{}'", name),
        }
    }
}

pub async fn run(command: Command) -> Result<()> {
    let config = Config::load()?;
    let store = config.build_store()?;
    let client = ApiClient::new(&config, store).context("Failed to create API client")?;
    let mut events = client.subscribe();

    let session = Session::new(client);
    session.init();

    let result = match command {
        Command::Login { email } => login(&session, email).await,
        Command::Logout => {
            session.logout();
            println!("Logged out.");
            Ok(())
        }
        Command::Status => {
            status(&session, &config);
            Ok(())
        }
        Command::Request { method, path, body } => request(&session, method, path, body).await,
        Command::Help => Ok(()),
    };

    report_invalidation(&mut events);
    session.dispose();
    result
}

/// Stand-in for sending the user back to the login screen
fn report_invalidation(events: &mut broadcast::Receiver<SessionEvent>) {
    let mut invalidated = false;
    loop {
        match events.try_recv() {
            Ok(SessionEvent::Invalidated) => invalidated = true,
            Ok(SessionEvent::TokenRefreshed) => {}
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    if invalidated {
        eprintln!("Your session has expired. Run `partsdesk login` to sign in again.");
    }
}

async fn login(session: &Session, email: Option<String>) -> Result<()> {
    let mut stored = Config::load_file()?;

    let email = match email {
        Some(email) => email,
        None => prompt_email(stored.last_email.as_deref())?,
    };
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;

    session
        .login(Credentials::new(email.clone(), password))
        .await
        .context("Login failed")?;

    stored.last_email = Some(email.clone());
    if let Err(e) = stored.save() {
        warn!(error = %e, "Failed to remember email");
    }

    println!("Logged in as {}.", email);
    Ok(())
}

fn prompt_email(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => print!("Email [{}]: ", last),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let entered = line.trim();

    match (entered.is_empty(), last) {
        (false, _) => Ok(entered.to_string()),
        (true, Some(last)) => Ok(last.to_string()),
        (true, None) => bail!("Email is required"),
    }
}

fn status(session: &Session, config: &Config) {
    if session.is_authenticated() {
        println!("Logged in ({})", config.api_base_url);
    } else {
        println!("Not logged in ({})", config.api_base_url);
    }
}

async fn request(
    session: &Session,
    method: Method,
    path: String,
    body: Option<Value>,
) -> Result<()> {
    if !session.is_authenticated() {
        warn!("No active session, sending request without a token");
    }

    let mut request = OutgoingRequest::new(method, path);
    if let Some(ref body) = body {
        request = request.json(body)?;
    }

    let value: Value = match session.client().send_json(request).await {
        Ok(value) => value,
        Err(e) => {
            let context = failure_context(&e);
            return Err(e).context(context);
        }
    };

    if !value.is_null() {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

fn failure_context(error: &ApiError) -> String {
    if error.is_session_expired() {
        "Request failed, not logged in. Run `partsdesk login` to sign in.".to_string()
    } else if let Some(status) = error.status() {
        format!("Request failed with HTTP {}", status)
    } else {
        "Request failed".to_string()
    }
}
