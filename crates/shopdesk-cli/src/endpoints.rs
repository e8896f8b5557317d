//! Endpoint table for the admin API.
//!
//! Every request the CLI makes is declared here, together with the tags its
//! response provides or the tags a successful call invalidates.

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

use shopdesk_core::{Endpoint, EndpointError, QueryError, TagTemplate};

pub struct Endpoints {
    pub login: Endpoint,
    pub whoami: Endpoint,
    pub list_shops: Endpoint,
    pub get_shop: Endpoint,
    pub approve_shop: Endpoint,
    pub list_orders: Endpoint,
    pub get_order: Endpoint,
    pub list_redemptions: Endpoint,
    pub approve_redemption: Endpoint,
}

impl Endpoints {
    pub fn build() -> Result<Self, EndpointError> {
        Ok(Self {
            login: Endpoint::mutation("login", Method::POST, "/auth/login")
                .public()
                .build()?,
            whoami: Endpoint::query("whoami", "/me")
                .provides(TagTemplate::id("Me", "current"))
                .build()?,

            list_shops: Endpoint::query("listShops", "/shops")
                .provides(TagTemplate::all("Shop"))
                .provides(TagTemplate::each_result("Shop", "id"))
                .transform(unwrap_items)
                .build()?,
            get_shop: Endpoint::query("getShop", "/shops/{id}")
                .provides(TagTemplate::from_arg("Shop", "id"))
                .build()?,
            approve_shop: Endpoint::mutation("approveShop", Method::POST, "/shops/{id}/approve")
                .invalidates(TagTemplate::from_arg("Shop", "id"))
                .build()?,

            list_orders: Endpoint::query("listOrders", "/orders")
                .provides(TagTemplate::all("Order"))
                .provides(TagTemplate::each_result("Order", "id"))
                .transform(unwrap_items)
                .build()?,
            get_order: Endpoint::query("getOrder", "/orders/{id}")
                .provides(TagTemplate::from_arg("Order", "id"))
                .build()?,

            list_redemptions: Endpoint::query("listRedemptions", "/redemptions")
                .provides(TagTemplate::all("Redemption"))
                .provides(TagTemplate::each_result("Redemption", "id"))
                .transform(unwrap_items)
                .build()?,
            approve_redemption: Endpoint::mutation(
                "approveRedemption",
                Method::POST,
                "/redemptions/{id}/approve",
            )
            .invalidates(TagTemplate::from_arg("Redemption", "id"))
            // Approving a redemption changes the shop's balance
            .invalidates(TagTemplate::all("Shop"))
            .build()?,
        })
    }
}

/// List endpoints answer either a bare array or `{ "items": [...] }`.
fn unwrap_items(body: Value) -> Result<Value, QueryError> {
    match body {
        Value::Array(_) => Ok(body),
        Value::Object(mut map) => match map.remove("items") {
            Some(items @ Value::Array(_)) => Ok(items),
            _ => Err(QueryError::InvalidResponse(
                "expected an array or an object with items".to_string(),
            )),
        },
        _ => Err(QueryError::InvalidResponse("expected a list".to_string())),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginUser {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub user: LoginUser,
    #[serde(default)]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}
