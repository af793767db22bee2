use std::path::PathBuf;

use anyhow::Result;
use chrono::FixedOffset;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;
use shared::*;
use crate::invoice::{render_pdf, InvoiceData, InvoiceStore};
use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

const BATCH_SIZE: i64 = 100;

/// Renders invoices for committed orders. Orders write an `InvoiceRequested`
/// outbox event in their transaction; the event is marked processed only
/// once the PDF is on disk, so failed renders are picked up again by `run`.
#[derive(Clone)]
pub struct InvoiceProcessor {
    pool: DbPool,
    store: InvoiceStore,
    offset: FixedOffset,
}

impl InvoiceProcessor {
    pub fn new(pool: DbPool, store: InvoiceStore, offset: FixedOffset) -> Self {
        Self { pool, store, offset }
    }

    pub fn store(&self) -> &InvoiceStore {
        &self.store
    }

    pub async fn run(&self, poll_interval: Duration) {
        let mut interval = time::interval(poll_interval);

        loop {
            interval.tick().await;

            if let Err(e) = self.process_outbox_events().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    async fn process_outbox_events(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let pending = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .filter(outbox_events::event_type.eq(INVOICE_REQUESTED))
            .order(outbox_events::created_at.asc())
            .limit(BATCH_SIZE)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;

        for event in pending {
            if let Err(e) = self.issue(&mut conn, &event).await {
                error!("Failed to render invoice for event {}: {}", event.id, e);
                continue;
            }
            info!("Processed outbox event: {}", event.id);
        }

        Ok(())
    }

    /// Renders the invoice of a just-finalized order and returns its URL.
    pub async fn issue_for_order(&self, order_id: Uuid) -> Result<String> {
        let mut conn = self.pool.get().await?;

        let event = outbox_events::table
            .filter(outbox_events::aggregate_id.eq(order_id))
            .filter(outbox_events::event_type.eq(INVOICE_REQUESTED))
            .first::<DbOutboxEvent>(&mut conn)
            .await
            .optional()?;

        let number = match event {
            Some(event) if event.processed != Some(true) => self.issue(&mut conn, &event).await?,
            Some(event) => {
                let request: InvoiceRequested = serde_json::from_value(event.event_data)?;
                request.order_number
            }
            None => {
                warn!("No invoice request recorded for order {}", order_id);
                let order = orders::table.find(order_id).first::<Order>(&mut conn).await?;
                self.render(&mut conn, order_id).await?;
                order.number()
            }
        };

        Ok(self.store.url_for(number))
    }

    async fn issue(&self, conn: &mut AsyncPgConnection, event: &DbOutboxEvent) -> Result<OrderNumber> {
        let request: InvoiceRequested = serde_json::from_value(event.event_data.clone())?;
        self.render(conn, request.order_id).await?;

        diesel::update(outbox_events::table.filter(outbox_events::id.eq(event.id)))
            .set(outbox_events::processed.eq(true))
            .execute(conn)
            .await?;

        Ok(request.order_number)
    }

    async fn render(&self, conn: &mut AsyncPgConnection, order_id: Uuid) -> Result<PathBuf> {
        let invoice = load_invoice(conn, order_id, self.offset).await?;
        let pdf = render_pdf(&invoice)?;
        let path = self.store.save(invoice.number, &pdf).await?;
        info!("Invoice for order {} written to {}", invoice.number, path.display());
        Ok(path)
    }
}

async fn load_invoice(conn: &mut AsyncPgConnection, order_id: Uuid, offset: FixedOffset) -> Result<InvoiceData> {
    let order = orders::table.find(order_id).first::<Order>(conn).await?;
    let user = users::table.find(order.user_id).first::<User>(conn).await?;
    let lines = order_lines::table
        .inner_join(products::table)
        .filter(order_lines::order_id.eq(order_id))
        .order(products::name.asc())
        .load::<(OrderLine, Product)>(conn)
        .await?;

    Ok(InvoiceData::new(&order, &user, lines, offset))
}
