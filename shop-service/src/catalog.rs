use std::collections::HashMap;

use anyhow::Result;
use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use shared::StoreError;
use uuid::Uuid;
use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

const SIMILAR_PRODUCTS_LIMIT: i64 = 8;

/// Query-string filters for the product listing. Both are optional and
/// combine with AND.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductFilter {
    pub q: Option<String>,
    pub category: Option<Uuid>,
}

impl ProductFilter {
    fn text(&self) -> Option<&str> {
        self.q.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }
}

#[derive(Debug, Serialize)]
pub struct ProductSummary {
    #[serde(flatten)]
    pub product: Product,
    pub unit_price: BigDecimal,
    pub savings: BigDecimal,
}

impl From<Product> for ProductSummary {
    fn from(product: Product) -> Self {
        Self {
            unit_price: product.unit_price(),
            savings: product.savings(),
            product,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProductDetail {
    #[serde(flatten)]
    pub summary: ProductSummary,
    pub images: Vec<ProductImage>,
    pub similar: Vec<ProductSummary>,
}

#[derive(Debug, Serialize)]
pub struct CategorySummary {
    pub id: Uuid,
    pub name: String,
    pub product_count: i64,
}

pub struct CatalogStore {
    pool: DbPool,
}

impl CatalogStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, filter: &ProductFilter) -> Result<Vec<Product>> {
        let mut conn = self.pool.get().await?;

        let mut query = products::table.into_boxed();
        if let Some(text) = filter.text() {
            let pattern = like_pattern(text);
            query = query.filter(
                products::name
                    .ilike(pattern.clone())
                    .or(products::description.ilike(pattern)),
            );
        }
        if let Some(category_id) = filter.category {
            query = query.filter(products::category_id.eq(category_id));
        }

        let result = query
            .order(products::name.asc())
            .load::<Product>(&mut conn)
            .await?;
        Ok(result)
    }

    pub async fn detail(&self, id: Uuid) -> Result<ProductDetail> {
        let mut conn = self.pool.get().await?;
        let product = find_product(&mut conn, id).await?;

        let images = product_images::table
            .filter(product_images::product_id.eq(id))
            .load::<ProductImage>(&mut conn)
            .await?;

        let similar = match product.category_id {
            Some(category_id) => {
                products::table
                    .filter(products::category_id.eq(category_id))
                    .filter(products::id.ne(id))
                    .limit(SIMILAR_PRODUCTS_LIMIT)
                    .load::<Product>(&mut conn)
                    .await?
            }
            None => {
                products::table
                    .filter(products::category_id.is_null())
                    .filter(products::id.ne(id))
                    .limit(SIMILAR_PRODUCTS_LIMIT)
                    .load::<Product>(&mut conn)
                    .await?
            }
        };

        Ok(ProductDetail {
            summary: product.into(),
            images,
            similar: similar.into_iter().map(ProductSummary::from).collect(),
        })
    }

    pub async fn categories(&self) -> Result<Vec<CategorySummary>> {
        let mut conn = self.pool.get().await?;

        let all = categories::table
            .order(categories::name.asc())
            .load::<Category>(&mut conn)
            .await?;

        let counts: HashMap<Uuid, i64> = products::table
            .filter(products::category_id.is_not_null())
            .group_by(products::category_id)
            .select((products::category_id, diesel::dsl::count_star()))
            .load::<(Option<Uuid>, i64)>(&mut conn)
            .await?
            .into_iter()
            .filter_map(|(id, count)| id.map(|id| (id, count)))
            .collect();

        Ok(all
            .into_iter()
            .map(|category| CategorySummary {
                product_count: counts.get(&category.id).copied().unwrap_or(0),
                id: category.id,
                name: category.name,
            })
            .collect())
    }
}

pub async fn find_product(conn: &mut AsyncPgConnection, id: Uuid) -> Result<Product> {
    let product = products::table
        .find(id)
        .first::<Product>(conn)
        .await
        .optional()?
        .ok_or(StoreError::product_not_found(id))?;
    Ok(product)
}

/// Case-insensitive substring pattern for ILIKE with the wildcard
/// characters of the user's text escaped.
fn like_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_pattern_wraps_and_escapes() {
        assert_eq!(like_pattern("mouse"), "%mouse%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
        assert_eq!(like_pattern("a\\b"), "%a\\\\b%");
    }

    #[test]
    fn test_blank_filter_text_is_ignored() {
        let filter = ProductFilter { q: Some("   ".to_string()), category: None };
        assert_eq!(filter.text(), None);

        let filter = ProductFilter { q: Some(" Teclado ".to_string()), category: None };
        assert_eq!(filter.text(), Some("Teclado"));
    }
}
