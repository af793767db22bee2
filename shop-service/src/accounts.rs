use std::collections::HashMap;

use anyhow::Result;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use shared::*;
use crate::invoice::InvoiceStore;
use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

const USERNAME_MAX: usize = 150;
const NAME_MAX: usize = 30;
const EMAIL_MAX: usize = 254;
const PHONE_MAX: usize = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

impl RegisterRequest {
    pub fn validate(&self) -> Result<(), StoreError> {
        required("username", &self.username, USERNAME_MAX)?;
        required("first_name", &self.first_name, NAME_MAX)?;
        required("last_name", &self.last_name, NAME_MAX)?;
        validate_email(&self.email)?;
        required("phone", &self.phone, PHONE_MAX)?;
        Ok(())
    }

    fn into_new_user(self) -> NewUser {
        NewUser {
            id: Uuid::new_v4(),
            username: self.username.trim().to_string(),
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
            email: self.email.trim().to_string(),
            phone: Some(self.phone.trim().to_string()),
        }
    }
}

/// Partial profile edit; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl ProfileUpdate {
    pub fn validate(&self) -> Result<(), StoreError> {
        if let Some(first_name) = &self.first_name {
            required("first_name", first_name, NAME_MAX)?;
        }
        if let Some(last_name) = &self.last_name {
            required("last_name", last_name, NAME_MAX)?;
        }
        if let Some(email) = &self.email {
            validate_email(email)?;
        }
        if let Some(phone) = &self.phone {
            required("phone", phone, PHONE_MAX)?;
        }
        Ok(())
    }

    fn into_changes(self) -> UserChanges {
        let trimmed = |value: Option<String>| value.map(|v| v.trim().to_string());
        UserChanges {
            first_name: trimmed(self.first_name),
            last_name: trimmed(self.last_name),
            email: trimmed(self.email),
            phone: trimmed(self.phone),
        }
    }

    fn is_empty(&self) -> bool {
        self.first_name.is_none() && self.last_name.is_none() && self.email.is_none() && self.phone.is_none()
    }
}

fn required(field: &str, value: &str, max: usize) -> Result<(), StoreError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(StoreError::Invalid(format!("{} is required", field)));
    }
    if value.chars().count() > max {
        return Err(StoreError::Invalid(format!("{} must be at most {} characters", field, max)));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), StoreError> {
    required("email", email, EMAIL_MAX)?;
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => Ok(()),
        _ => Err(StoreError::Invalid(format!("{} is not a valid email address", email))),
    }
}

#[derive(Debug, Serialize)]
pub struct OrderLineView {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub subtotal: BigDecimal,
}

#[derive(Debug, Serialize)]
pub struct OrderSummary {
    pub id: Uuid,
    pub order_number: String,
    pub created_at: DateTime<Utc>,
    pub total: BigDecimal,
    pub shipping_address: Option<String>,
    pub paid: bool,
    pub invoice_url: String,
    pub lines: Vec<OrderLineView>,
}

pub struct AccountStore {
    pool: DbPool,
    invoices: InvoiceStore,
}

impl AccountStore {
    pub fn new(pool: DbPool, invoices: InvoiceStore) -> Self {
        Self { pool, invoices }
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<User> {
        request.validate()?;
        let mut conn = self.pool.get().await?;

        let username = request.username.trim().to_string();
        let user = diesel::insert_into(users::table)
            .values(&request.into_new_user())
            .get_result::<User>(&mut conn)
            .await
            .map_err(|e| match e {
                DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                    anyhow::Error::from(StoreError::Conflict(format!("username {} is taken", username)))
                }
                other => other.into(),
            })?;

        info!("Registered user {} ({})", user.username, user.id);
        Ok(user)
    }

    pub async fn profile(&self, user_id: Uuid) -> Result<User> {
        let mut conn = self.pool.get().await?;
        find_user(&mut conn, user_id).await
    }

    pub async fn update_profile(&self, user_id: Uuid, update: ProfileUpdate) -> Result<User> {
        update.validate()?;
        let mut conn = self.pool.get().await?;

        if update.is_empty() {
            return find_user(&mut conn, user_id).await;
        }

        let user = diesel::update(users::table.filter(users::id.eq(user_id)))
            .set(&update.into_changes())
            .get_result::<User>(&mut conn)
            .await
            .optional()?
            .ok_or(StoreError::Unauthorized)?;
        Ok(user)
    }

    /// The user's orders, newest first.
    pub async fn order_history(&self, user_id: Uuid) -> Result<Vec<OrderSummary>> {
        let mut conn = self.pool.get().await?;
        find_user(&mut conn, user_id).await?;

        let orders = orders::table
            .filter(orders::user_id.eq(user_id))
            .order(orders::created_at.desc())
            .load::<Order>(&mut conn)
            .await?;

        let order_ids: Vec<Uuid> = orders.iter().map(|order| order.id).collect();
        let mut lines_by_order: HashMap<Uuid, Vec<OrderLineView>> = HashMap::new();
        let lines = order_lines::table
            .inner_join(products::table)
            .filter(order_lines::order_id.eq_any(order_ids))
            .order(products::name.asc())
            .load::<(OrderLine, Product)>(&mut conn)
            .await?;
        for (line, product) in lines {
            lines_by_order.entry(line.order_id).or_default().push(OrderLineView {
                product_id: product.id,
                product_name: product.name,
                quantity: line.quantity,
                subtotal: &line.unit_price * BigDecimal::from(line.quantity),
                unit_price: line.unit_price,
            });
        }

        Ok(orders
            .into_iter()
            .map(|order| OrderSummary {
                order_number: order.number().to_string(),
                invoice_url: self.invoices.url_for(order.number()),
                lines: lines_by_order.remove(&order.id).unwrap_or_default(),
                id: order.id,
                created_at: order.created_at,
                total: order.total,
                shipping_address: order.shipping_address,
                paid: order.paid,
            })
            .collect())
    }
}

async fn find_user(conn: &mut AsyncPgConnection, user_id: Uuid) -> Result<User> {
    let user = users::table
        .find(user_id)
        .first::<User>(conn)
        .await
        .optional()?
        .ok_or(StoreError::Unauthorized)?;
    Ok(user)
}
