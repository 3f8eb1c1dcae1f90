//! Prints every message the account can see until interrupted.
//!
//! Run with a bot token:
//!   CHATWIRE_TOKEN="Bot ..." cargo run -p echo-bot
//!
//! Or as a user account:
//!   CHATWIRE_EMAIL=... CHATWIRE_PASSWORD=... [CHATWIRE_TOTP=123456] cargo run -p echo-bot

use std::{env, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chatwire_api::{ApiClient, ApiConfig};
use chatwire_gateway::WsConnector;
use chatwire_session::{AuthError, Event, Handler, Identifier, Intents, Session};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chatwire_session=debug".into()),
        )
        .init();

    let session = build_session().await?;
    let (_subscription, mut events) = session.handler().subscribe();

    // Bound only the wait for READY; the connection outlives it.
    let cancel = CancellationToken::new();
    let timer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(OPEN_TIMEOUT).await;
            cancel.cancel();
        })
    };
    session.open(&cancel).await.context("failed to open session")?;
    timer.abort();
    tracing::info!("Session open, press Ctrl-C to quit");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ev = events.recv() => match ev {
                Some(Event::Ready(ready)) => {
                    tracing::info!(user = %ready.user.username, "Ready");
                }
                Some(Event::MessageCreate(msg)) => {
                    let msg = msg.0;
                    println!("#{} <{}> {}", msg.channel_id, msg.author.username, msg.content);
                }
                Some(Event::BackgroundError(ev)) => {
                    tracing::warn!(error = %ev.error, "Skipped undecodable frame");
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    if let Err(e) = session.close().await {
        tracing::warn!("Session closed with error: {e}");
    }
    Ok(())
}

async fn build_session() -> Result<Session> {
    let config = ApiConfig::from_env();

    if let Ok(token) = env::var("CHATWIRE_TOKEN") {
        return Ok(bot_session(token, config));
    }

    let email = env::var("CHATWIRE_EMAIL").context("set CHATWIRE_TOKEN or CHATWIRE_EMAIL")?;
    let password = env::var("CHATWIRE_PASSWORD").context("CHATWIRE_PASSWORD is not set")?;
    let code = env::var("CHATWIRE_TOTP").unwrap_or_default();

    let api = ApiClient::with_config("", config);
    match Session::login(&api, &email, &password, &code).await {
        Ok(session) => Ok(session),
        Err(AuthError::MfaRequired) => {
            anyhow::bail!("account has 2FA enabled, set CHATWIRE_TOTP")
        }
        Err(e) => Err(e).context("login failed"),
    }
}

/// Bot session whose REST client and gateway discovery use `config`.
fn bot_session(token: String, config: ApiConfig) -> Session {
    let mut id = Identifier::new(token.clone());
    id.add_intents(Intents::GUILDS | Intents::GUILD_MESSAGES | Intents::MESSAGE_CONTENT);
    let api = ApiClient::with_config(token, config);
    let connector = Arc::new(WsConnector::new(api.clone()));
    Session::custom(id, api, Handler::new(), connector)
}
