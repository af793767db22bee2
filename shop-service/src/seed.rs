use anyhow::Result;
use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::info;
use uuid::Uuid;
use shared::validate_discount;
use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

pub const DEMO_CATEGORY: &str = "Genérica";
const DEMO_PRODUCTS: i32 = 10;
const DEMO_STOCK: i32 = 50;

/// Generic products used to populate an empty catalog.
pub fn demo_products(category_id: Uuid) -> Vec<NewProduct> {
    (1..=DEMO_PRODUCTS)
        .map(|i| NewProduct {
            id: Uuid::new_v4(),
            category_id: Some(category_id),
            name: format!("Producto Genérico {}", i),
            description: format!("Descripción de prueba para el producto {}.", i),
            price: BigDecimal::from(100 + i * 10),
            discount: 0,
            stock: DEMO_STOCK,
        })
        .collect()
}

/// Loads the demo catalog unless the store already has products. Returns the
/// number of products inserted.
pub async fn seed_catalog(pool: &DbPool) -> Result<usize> {
    let mut conn = pool.get().await?;

    let existing = products::table
        .count()
        .get_result::<i64>(&mut conn)
        .await?;
    if existing > 0 {
        info!("Catalog already has {} products, skipping seed", existing);
        return Ok(0);
    }

    let inserted = conn.transaction::<_, anyhow::Error, _>(|conn| {
        Box::pin(async move {
            diesel::insert_into(categories::table)
                .values(&Category { id: Uuid::new_v4(), name: DEMO_CATEGORY.to_string() })
                .on_conflict(categories::name)
                .do_nothing()
                .execute(conn)
                .await?;

            let category_id = categories::table
                .filter(categories::name.eq(DEMO_CATEGORY))
                .select(categories::id)
                .first::<Uuid>(conn)
                .await?;

            let products = demo_products(category_id);
            for product in &products {
                validate_discount(product.discount)?;
            }

            let inserted = diesel::insert_into(products::table)
                .values(&products)
                .execute(conn)
                .await?;
            Ok(inserted)
        })
    }).await?;

    info!("Seeded catalog with {} products", inserted);
    Ok(inserted)
}
