use std::sync::Arc;

use anyhow::Result;
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::info;
use uuid::Uuid;
use shared::*;
use crate::cart_store::{clear_lines, get_or_create, load_cart, CartStore};
use crate::gateway::{BackUrls, PaymentGateway, PreferenceRequest};
use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

/// Starts a hosted payment session for the user's cart.
pub struct CheckoutHandler {
    pool: DbPool,
    gateway: Arc<dyn PaymentGateway>,
    back_urls: BackUrls,
}

impl CheckoutHandler {
    pub fn new(pool: DbPool, gateway: Arc<dyn PaymentGateway>, back_urls: BackUrls) -> Self {
        Self { pool, gateway, back_urls }
    }

    /// Remembers the shipping address on the cart and returns the
    /// processor's checkout URL.
    pub async fn start(&self, user_id: Uuid, address: &str) -> Result<String> {
        let cart = CartStore::new(self.pool.clone())
            .set_shipping_address(user_id, address)
            .await?;

        let mut conn = self.pool.get().await?;
        let email = users::table
            .find(user_id)
            .select(users::email)
            .first::<String>(&mut conn)
            .await?;

        let request = PreferenceRequest::for_cart(&cart, &email, self.back_urls.clone())?;
        let url = self.gateway.create_checkout(&request).await?;

        info!(
            "Created checkout {} for cart {} ({} items)",
            request.external_reference,
            cart.id,
            cart.item_count()
        );
        Ok(url)
    }
}

#[derive(Debug, Clone)]
pub struct FinalizedOrder {
    pub order: Order,
    pub lines: Vec<OrderLine>,
}

/// Turns a paid cart into an order.
pub struct OrderFinalizer {
    pool: DbPool,
}

impl OrderFinalizer {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Creates the order, its line snapshots, the stock decrements and the
    /// invoice request in one transaction, and empties the cart. `address`
    /// overrides the one stored on the cart at checkout.
    pub async fn finalize(&self, user_id: Uuid, address: Option<String>) -> Result<FinalizedOrder> {
        let mut conn = self.pool.get().await?;

        let finalized = conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let db_cart = get_or_create(conn, user_id).await?;
                let address = address
                    .or_else(|| db_cart.shipping_address.clone())
                    .unwrap_or_default();

                let cart = load_cart(conn, db_cart, true).await?;
                let plan = OrderPlan::from_cart(&cart)?;

                let order_number = next_order_number(conn).await?;
                let new_order = NewOrder {
                    id: Uuid::new_v4(),
                    user_id,
                    order_number: order_number.0,
                    total: plan.total.clone(),
                    shipping_address: Some(address),
                    paid: true,
                };

                let order = diesel::insert_into(orders::table)
                    .values(&new_order)
                    .get_result::<Order>(conn)
                    .await?;

                let lines: Vec<OrderLine> = plan
                    .lines
                    .iter()
                    .map(|line| OrderLine {
                        id: Uuid::new_v4(),
                        order_id: order.id,
                        product_id: line.product_id,
                        quantity: line.quantity,
                        unit_price: line.unit_price.clone(),
                    })
                    .collect();

                diesel::insert_into(order_lines::table)
                    .values(&lines)
                    .execute(conn)
                    .await?;

                for change in &plan.stock {
                    diesel::update(products::table.filter(products::id.eq(change.product_id)))
                        .set(products::stock.eq(change.remaining))
                        .execute(conn)
                        .await?;
                }

                clear_lines(conn, cart.id).await?;
                diesel::update(carts::table.filter(carts::id.eq(cart.id)))
                    .set(carts::shipping_address.eq(None::<String>))
                    .execute(conn)
                    .await?;

                let event = NewOutboxEvent::try_from(InvoiceRequested {
                    order_id: order.id,
                    order_number,
                })?;
                diesel::insert_into(outbox_events::table)
                    .values(&event)
                    .execute(conn)
                    .await?;

                Ok(FinalizedOrder { order, lines })
            })
        }).await?;

        info!(
            "Order {} created for user {}: {} lines, total {}",
            finalized.order.number(),
            user_id,
            finalized.lines.len(),
            finalized.order.total
        );

        Ok(finalized)
    }
}

async fn next_order_number(conn: &mut AsyncPgConnection) -> Result<OrderNumber> {
    let value = diesel::select(sql::<BigInt>("nextval('order_number_seq')"))
        .get_result::<i64>(conn)
        .await?;
    Ok(OrderNumber(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use std::str::FromStr;
    use crate::cart_store::CartStore;
    use crate::test_db::TestDb;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn test_finalize_snapshots_cart_and_decrements_stock() {
        let db = TestDb::new().await;
        let user = db.user().await;
        let a = db.product("Producto A", "100.00", 0, 5).await;
        let b = db.product("Producto B", "50.00", 0, 4).await;
        let carts = CartStore::new(db.pool.clone());
        carts.add(user, a).await.unwrap();
        carts.add(user, a).await.unwrap();
        carts.add(user, b).await.unwrap();
        carts.set_shipping_address(user, "Av. Corrientes 1234").await.unwrap();

        let finalized = OrderFinalizer::new(db.pool.clone()).finalize(user, None).await.unwrap();

        assert_eq!(finalized.order.number(), OrderNumber(1));
        assert_eq!(finalized.order.number().to_string(), "00001");
        assert_eq!(finalized.order.total, dec("250"));
        assert!(finalized.order.paid);
        assert_eq!(finalized.order.shipping_address.as_deref(), Some("Av. Corrientes 1234"));
        assert_eq!(finalized.lines.len(), 2);

        assert_eq!(db.stock(a).await, 3);
        assert_eq!(db.stock(b).await, 3);

        let cart = carts.view(user).await.unwrap();
        assert!(cart.is_empty());
        assert_eq!(cart.shipping_address, None);
        assert_eq!(db.pending_invoices().await, 1);
    }

    #[tokio::test]
    async fn test_empty_cart_creates_no_order_and_uses_no_number() {
        let db = TestDb::new().await;
        let user = db.user().await;
        let finalizer = OrderFinalizer::new(db.pool.clone());

        let err = finalizer.finalize(user, Some("Calle 1".to_string())).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::EmptyCart)));
        assert_eq!(db.order_count().await, 0);
        assert_eq!(db.pending_invoices().await, 0);

        let product = db.product("Producto", "10.00", 0, 1).await;
        CartStore::new(db.pool.clone()).add(user, product).await.unwrap();
        let finalized = finalizer.finalize(user, None).await.unwrap();
        assert_eq!(finalized.order.number(), OrderNumber(1));
    }

    #[tokio::test]
    async fn test_order_numbers_increase_and_oversold_stock_clamps() {
        let db = TestDb::new().await;
        let user = db.user().await;
        let first = db.product("Primero", "10.00", 0, 3).await;
        let scarce = db.product("Escaso", "20.00", 0, 2).await;
        let carts = CartStore::new(db.pool.clone());
        let finalizer = OrderFinalizer::new(db.pool.clone());

        carts.add(user, first).await.unwrap();
        let order = finalizer.finalize(user, Some("Calle 1".to_string())).await.unwrap();
        assert_eq!(order.order.number(), OrderNumber(1));

        carts.add(user, scarce).await.unwrap();
        carts.add(user, scarce).await.unwrap();
        // Sold elsewhere after it was put in the cart.
        db.set_stock(scarce, 1).await;

        let order = finalizer.finalize(user, Some("Calle 2".to_string())).await.unwrap();
        assert_eq!(order.order.number(), OrderNumber(2));
        assert_eq!(order.order.shipping_address.as_deref(), Some("Calle 2"));
        assert_eq!(db.stock(scarce).await, 0);
        assert_eq!(db.stock(first).await, 2);
    }

    #[tokio::test]
    async fn test_stored_lines_add_up_to_order_total() {
        let db = TestDb::new().await;
        let user = db.user().await;
        let product = db.product("Auriculares", "59.90", 15, 10).await;
        let carts = CartStore::new(db.pool.clone());
        for _ in 0..3 {
            carts.add(user, product).await.unwrap();
        }

        let finalized = OrderFinalizer::new(db.pool.clone()).finalize(user, None).await.unwrap();

        let mut conn = db.pool.get().await.unwrap();
        let stored = order_lines::table
            .filter(order_lines::order_id.eq(finalized.order.id))
            .load::<OrderLine>(&mut conn)
            .await
            .unwrap();
        let sum: BigDecimal = stored
            .iter()
            .map(|line| &line.unit_price * BigDecimal::from(line.quantity))
            .sum();

        assert_eq!(stored[0].unit_price, dec("50.92"));
        assert_eq!(finalized.order.total, dec("152.76"));
        assert_eq!(sum, finalized.order.total);
    }
}
