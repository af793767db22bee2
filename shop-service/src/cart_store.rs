use anyhow::Result;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use tracing::info;
use uuid::Uuid;
use shared::*;
use crate::catalog::find_product;
use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

pub struct CartStore {
    pool: DbPool,
}

impl CartStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn view(&self, user_id: Uuid) -> Result<Cart> {
        let mut conn = self.pool.get().await?;
        let cart = get_or_create(&mut conn, user_id).await?;
        load_cart(&mut conn, cart, false).await
    }

    pub async fn add(&self, user_id: Uuid, product_id: Uuid) -> Result<Cart> {
        let mut conn = self.pool.get().await?;
        let product = find_product(&mut conn, product_id).await?;
        let cart = get_or_create(&mut conn, user_id).await?;

        let current = line_quantity(&mut conn, cart.id, product_id).await?;
        match add_one(current, product.stock) {
            LineChange::Insert => {
                let line = DbCartLine {
                    id: Uuid::new_v4(),
                    cart_id: cart.id,
                    product_id,
                    quantity: 1,
                };
                diesel::insert_into(cart_lines::table)
                    .values(&line)
                    .on_conflict((cart_lines::cart_id, cart_lines::product_id))
                    .do_nothing()
                    .execute(&mut conn)
                    .await?;
            }
            LineChange::SetQuantity(quantity) => {
                set_quantity(&mut conn, cart.id, product_id, quantity).await?;
            }
            LineChange::Unchanged | LineChange::Delete => {
                info!("Product {} not added to cart {}: stock {}", product_id, cart.id, product.stock);
            }
        }

        load_cart(&mut conn, cart, false).await
    }

    pub async fn remove(&self, user_id: Uuid, product_id: Uuid) -> Result<Cart> {
        let mut conn = self.pool.get().await?;
        find_product(&mut conn, product_id).await?;
        let cart = get_or_create(&mut conn, user_id).await?;

        let current = line_quantity(&mut conn, cart.id, product_id).await?;
        match remove_one(current) {
            LineChange::SetQuantity(quantity) => {
                set_quantity(&mut conn, cart.id, product_id, quantity).await?;
            }
            LineChange::Delete => {
                diesel::delete(
                    cart_lines::table
                        .filter(cart_lines::cart_id.eq(cart.id))
                        .filter(cart_lines::product_id.eq(product_id)),
                )
                .execute(&mut conn)
                .await?;
            }
            LineChange::Insert | LineChange::Unchanged => {}
        }

        load_cart(&mut conn, cart, false).await
    }

    pub async fn clear(&self, user_id: Uuid) -> Result<Cart> {
        let mut conn = self.pool.get().await?;
        let cart = get_or_create(&mut conn, user_id).await?;
        clear_lines(&mut conn, cart.id).await?;
        load_cart(&mut conn, cart, false).await
    }

    pub async fn set_shipping_address(&self, user_id: Uuid, address: &str) -> Result<Cart> {
        let mut conn = self.pool.get().await?;
        let mut cart = get_or_create(&mut conn, user_id).await?;

        diesel::update(carts::table.filter(carts::id.eq(cart.id)))
            .set(carts::shipping_address.eq(address))
            .execute(&mut conn)
            .await?;
        cart.shipping_address = Some(address.to_string());

        load_cart(&mut conn, cart, false).await
    }
}

/// Returns the user's cart, creating it on first access. The unique index on
/// `carts.user_id` keeps concurrent first requests down to a single cart.
pub async fn get_or_create(conn: &mut AsyncPgConnection, user_id: Uuid) -> Result<DbCart> {
    let user_exists = users::table
        .find(user_id)
        .select(users::id)
        .first::<Uuid>(conn)
        .await
        .optional()?
        .is_some();
    if !user_exists {
        return Err(StoreError::Unauthorized.into());
    }

    diesel::insert_into(carts::table)
        .values(&NewCart { id: Uuid::new_v4(), user_id })
        .on_conflict(carts::user_id)
        .do_nothing()
        .execute(conn)
        .await?;

    let cart = carts::table
        .filter(carts::user_id.eq(user_id))
        .first::<DbCart>(conn)
        .await?;
    Ok(cart)
}

/// Loads the cart's lines with their products. With `lock` set the product
/// rows stay locked until the surrounding transaction ends.
pub async fn load_cart(conn: &mut AsyncPgConnection, cart: DbCart, lock: bool) -> Result<Cart> {
    let query = cart_lines::table
        .inner_join(products::table)
        .filter(cart_lines::cart_id.eq(cart.id))
        .order(products::name.asc());

    let lines = if lock {
        query.for_update().load::<(DbCartLine, Product)>(conn).await?
    } else {
        query.load::<(DbCartLine, Product)>(conn).await?
    };

    Ok(cart.into_cart(lines))
}

pub async fn clear_lines(conn: &mut AsyncPgConnection, cart_id: Uuid) -> Result<usize> {
    let deleted = diesel::delete(cart_lines::table.filter(cart_lines::cart_id.eq(cart_id)))
        .execute(conn)
        .await?;
    Ok(deleted)
}

async fn line_quantity(conn: &mut AsyncPgConnection, cart_id: Uuid, product_id: Uuid) -> Result<Option<i32>> {
    let quantity = cart_lines::table
        .filter(cart_lines::cart_id.eq(cart_id))
        .filter(cart_lines::product_id.eq(product_id))
        .select(cart_lines::quantity)
        .first::<i32>(conn)
        .await
        .optional()?;
    Ok(quantity)
}

async fn set_quantity(conn: &mut AsyncPgConnection, cart_id: Uuid, product_id: Uuid, quantity: i32) -> Result<()> {
    diesel::update(
        cart_lines::table
            .filter(cart_lines::cart_id.eq(cart_id))
            .filter(cart_lines::product_id.eq(product_id)),
    )
    .set(cart_lines::quantity.eq(quantity))
    .execute(conn)
    .await?;
    Ok(())
}
