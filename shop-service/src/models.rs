use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::*;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::categories)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::products)]
pub struct Product {
    pub id: Uuid,
    pub category_id: Option<Uuid>,
    pub name: String,
    pub description: String,
    pub price: BigDecimal,
    pub discount: i32,
    pub stock: i32,
    pub image: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Product {
    pub fn unit_price(&self) -> BigDecimal {
        discounted_price(&self.price, self.discount)
    }

    pub fn savings(&self) -> BigDecimal {
        savings(&self.price, self.discount)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::products)]
pub struct NewProduct {
    pub id: Uuid,
    pub category_id: Option<Uuid>,
    pub name: String,
    pub description: String,
    pub price: BigDecimal,
    pub discount: i32,
    pub stock: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::product_images)]
pub struct ProductImage {
    pub id: Uuid,
    pub product_id: Uuid,
    pub image: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::users)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::users)]
pub struct NewUser {
    pub id: Uuid,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::users)]
pub struct UserChanges {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::carts)]
pub struct DbCart {
    pub id: Uuid,
    pub user_id: Uuid,
    pub shipping_address: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::carts)]
pub struct NewCart {
    pub id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable)]
#[diesel(table_name = crate::schema::cart_lines)]
pub struct DbCartLine {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub order_number: i64,
    pub total: BigDecimal,
    pub shipping_address: Option<String>,
    pub paid: bool,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn number(&self) -> OrderNumber {
        OrderNumber(self.order_number)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub order_number: i64,
    pub total: BigDecimal,
    pub shipping_address: Option<String>,
    pub paid: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::order_lines)]
pub struct OrderLine {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
}

impl DbCartLine {
    pub fn priced(self, product: Product) -> CartLine {
        CartLine {
            product_id: product.id,
            product_name: product.name,
            quantity: self.quantity,
            price: product.price,
            discount: product.discount,
            stock: product.stock,
        }
    }
}

impl DbCart {
    pub fn into_cart(self, lines: Vec<(DbCartLine, Product)>) -> Cart {
        Cart {
            id: self.id,
            user_id: self.user_id,
            shipping_address: self.shipping_address,
            lines: lines
                .into_iter()
                .map(|(line, product)| line.priced(product))
                .collect(),
        }
    }
}

impl TryFrom<InvoiceRequested> for NewOutboxEvent {
    type Error = anyhow::Error;

    fn try_from(event: InvoiceRequested) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_id: event.order_id,
            event_type: INVOICE_REQUESTED.to_string(),
            event_data: serde_json::to_value(&event)?,
        })
    }
}
