use async_trait::async_trait;
use chrono::Utc;
use num_traits::ToPrimitive;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use shared::*;

/// Where the processor sends the buyer back to after paying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackUrls {
    pub success: String,
    pub failure: String,
    pub pending: String,
}

impl BackUrls {
    pub fn under(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            success: format!("{}/checkout/success", base),
            failure: format!("{}/checkout/failure", base),
            pending: format!("{}/checkout/pending", base),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreferenceItem {
    pub title: String,
    pub quantity: i32,
    pub unit_price: f64,
    pub currency_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Payer {
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreferenceRequest {
    pub items: Vec<PreferenceItem>,
    pub payer: Payer,
    pub external_reference: String,
    pub back_urls: BackUrls,
}

impl PreferenceRequest {
    pub fn for_cart(cart: &Cart, email: &str, back_urls: BackUrls) -> Result<Self, StoreError> {
        if cart.is_empty() {
            return Err(StoreError::EmptyCart);
        }

        let items = cart
            .lines
            .iter()
            .map(|line| {
                let unit_price = line.unit_price().to_f64().ok_or_else(|| {
                    StoreError::Invalid(format!("price of {} is not representable", line.product_name))
                })?;
                Ok(PreferenceItem {
                    title: line.product_name.clone(),
                    quantity: line.quantity,
                    unit_price,
                    currency_id: CURRENCY_ID.to_string(),
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Self {
            items,
            payer: Payer { email: email.to_string() },
            external_reference: external_reference(),
            back_urls,
        })
    }
}

/// `ORDER_<unix seconds>_<four random digits>`.
pub fn external_reference() -> String {
    let suffix: u16 = rand::thread_rng().gen_range(1000..=9999);
    format!("ORDER_{}_{}", Utc::now().timestamp(), suffix)
}

/// Client for the payment processor's hosted checkout ("preferences").
///
/// Turns a cart into a checkout session and hands back the URL the buyer is
/// redirected to. Nothing here retries: a transport failure or an answer
/// without a redirect URL is reported as `StoreError::Gateway`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a hosted checkout session and returns its URL.
    async fn create_checkout(&self, request: &PreferenceRequest) -> Result<String, StoreError>;
}

#[derive(Debug, Deserialize)]
struct PreferenceResponse {
    init_point: Option<String>,
    sandbox_init_point: Option<String>,
    message: Option<String>,
    cause: Option<serde_json::Value>,
}

pub struct MercadoPagoGateway {
    client: Client,
    base_url: String,
    access_token: String,
    sandbox: bool,
}

impl MercadoPagoGateway {
    /// `base_url` is the API root, e.g. `https://api.mercadopago.com`. In
    /// sandbox mode buyers are sent to the sandbox checkout.
    pub fn new(base_url: &str, access_token: &str, sandbox: bool) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            sandbox,
        }
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoGateway {
    async fn create_checkout(&self, request: &PreferenceRequest) -> Result<String, StoreError> {
        let response = self
            .client
            .post(format!("{}/checkout/preferences", self.base_url))
            .bearer_auth(&self.access_token)
            .json(request)
            .send()
            .await
            .map_err(|e| StoreError::Gateway(e.to_string()))?;

        let status = response.status();
        let body: PreferenceResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Gateway(format!("HTTP {}: {}", status, e)))?;

        let url = if self.sandbox {
            body.sandbox_init_point.clone()
        } else {
            body.init_point.clone()
        };

        match url {
            Some(url) if !url.is_empty() => Ok(url),
            _ => Err(StoreError::Gateway(describe_failure(status, &body))),
        }
    }
}

fn describe_failure(status: StatusCode, body: &PreferenceResponse) -> String {
    match (&body.cause, &body.message) {
        (Some(cause), _) if !cause.is_null() => cause.to_string(),
        (_, Some(message)) => message.clone(),
        _ => format!("HTTP {} without checkout URL", status),
    }
}
