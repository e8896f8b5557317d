use std::io::{self, Write};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tracing::{info, warn};

use shopdesk_core::{Config, Console, Credential, EntrySnapshot, Identity, SessionData, Tag};

use crate::args::{OrdersCmd, RedemptionsCmd, Resource, ShopsCmd};
use crate::endpoints::{Endpoints, LoginResponse};

pub struct Ctx {
    pub console: Console,
    pub endpoints: Endpoints,
}

// ============================================================================
// Session
// ============================================================================

pub async fn login(ctx: &Ctx, username: Option<String>, password: Option<String>) -> Result<()> {
    let mut config = Config::load()?;
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(username) => username,
        None => prompt_username()?,
    };
    let password = match password {
        Some(password) => password,
        None => rpassword::prompt_password("Password: ")?,
    };

    let data = authenticate(ctx, &username, &password).await?;
    let who = data.identity.username.clone().unwrap_or_else(|| data.identity.user_id.clone());
    ctx.console.start_session(data).await?;

    config.last_username = Some(username);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Signed in as {}", who);
    Ok(())
}

/// Exchange username and password for session data.
pub async fn authenticate(ctx: &Ctx, username: &str, password: &str) -> Result<SessionData> {
    if username.is_empty() || password.is_empty() {
        bail!("Username and password required");
    }

    let body = ctx
        .console
        .mutate(
            &ctx.endpoints.login,
            &json!({"username": username, "password": password}),
        )
        .await
        .context("Login failed")?;
    let response: LoginResponse =
        serde_json::from_value(body).context("Unexpected login response")?;

    let identity = Identity::new(response.user.id)
        .with_username(response.user.username.unwrap_or_else(|| username.to_string()));
    let mut data = SessionData::new(identity, Credential::new(response.token));
    if let Some(expires_at) = response.expires_at {
        data = data.expiring_at(expires_at);
    }
    info!(user_id = %data.identity.user_id, "Authenticated");
    Ok(data)
}

pub async fn logout(ctx: &Ctx) -> Result<()> {
    if !ctx.console.session().is_authenticated() {
        println!("Not signed in");
        return Ok(());
    }
    ctx.console.logout().await?;
    println!("Signed out");
    Ok(())
}

pub async fn whoami(ctx: &Ctx) -> Result<()> {
    let Some(session) = ctx.console.session().current() else {
        println!("Not signed in");
        return Ok(());
    };
    if let Some(minutes) = session.minutes_until_expiry() {
        eprintln!("Session expires in {} minutes", minutes);
    }
    show(ctx, &ctx.endpoints.whoami, Value::Null).await
}

// ============================================================================
// Resources
// ============================================================================

pub async fn shops(ctx: &Ctx, cmd: ShopsCmd) -> Result<()> {
    match cmd {
        ShopsCmd::List { status } => show(ctx, &ctx.endpoints.list_shops, json!({"status": status})).await,
        ShopsCmd::Show { id } => show(ctx, &ctx.endpoints.get_shop, json!({"id": id})).await,
        ShopsCmd::Approve { id, note } => {
            let result = ctx
                .console
                .mutate(&ctx.endpoints.approve_shop, &json!({"id": id, "note": note}))
                .await?;
            print_json(&result)
        }
    }
}

pub async fn orders(ctx: &Ctx, cmd: OrdersCmd) -> Result<()> {
    match cmd {
        OrdersCmd::List { shop, status } => {
            show(
                ctx,
                &ctx.endpoints.list_orders,
                json!({"shopId": shop, "status": status}),
            )
            .await
        }
        OrdersCmd::Show { id } => show(ctx, &ctx.endpoints.get_order, json!({"id": id})).await,
    }
}

pub async fn redemptions(ctx: &Ctx, cmd: RedemptionsCmd) -> Result<()> {
    match cmd {
        RedemptionsCmd::List { status } => {
            show(ctx, &ctx.endpoints.list_redemptions, json!({"status": status})).await
        }
        RedemptionsCmd::Approve { id } => {
            let result = ctx
                .console
                .mutate(&ctx.endpoints.approve_redemption, &json!({"id": id}))
                .await?;
            print_json(&result)
        }
    }
}

/// Keep a list subscribed and invalidate it every `interval`, printing it
/// whenever the refetched data differs.
pub async fn watch(ctx: &Ctx, resource: Resource, interval: Duration) -> Result<()> {
    let (endpoint, kind) = match resource {
        Resource::Shops => (&ctx.endpoints.list_shops, "Shop"),
        Resource::Orders => (&ctx.endpoints.list_orders, "Order"),
        Resource::Redemptions => (&ctx.endpoints.list_redemptions, "Redemption"),
    };
    let mut subscription = ctx.console.subscribe(endpoint, &Value::Null)?;

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut last = None;
    loop {
        let snapshot = subscription.wait_settled().await;
        report(&snapshot, &mut last)?;

        ticker.tick().await;
        ctx.console.cache().invalidate(&[Tag::all(kind)]);
    }
}

fn report(snapshot: &EntrySnapshot, last: &mut Option<Value>) -> Result<()> {
    if let Some(ref error) = snapshot.error {
        eprintln!("{}: {} ({})", snapshot.key, error, snapshot.status);
        return Ok(());
    }
    let Some(ref data) = snapshot.data else {
        return Ok(());
    };
    if last.as_ref() == Some(&**data) {
        return Ok(());
    }
    eprintln!("{} updated {}", snapshot.key, snapshot.age_display());
    print_json(data)?;
    *last = Some((**data).clone());
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

async fn show(ctx: &Ctx, endpoint: &shopdesk_core::Endpoint, args: Value) -> Result<()> {
    let data = ctx.console.read(endpoint, &args).await?;
    print_json(&data)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn prompt_username() -> Result<String> {
    print!("Username: ");
    io::stdout().flush()?;

    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    Ok(username.trim().to_string())
}
