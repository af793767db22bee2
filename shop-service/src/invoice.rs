use std::path::{Path, PathBuf};

use bigdecimal::BigDecimal;
use chrono::{DateTime, FixedOffset};
use printpdf::{
    BuiltinFont, IndirectFontRef, Line, Mm, PdfDocument, PdfDocumentReference, PdfLayerReference, Point,
};
use shared::*;
use uuid::Uuid;
use crate::models::*;

const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const MARGIN: f32 = 20.0;
const TOP: f32 = PAGE_HEIGHT - MARGIN;

const TITLE_SIZE: f32 = 18.0;
const TEXT_SIZE: f32 = 11.0;
const CELL_SIZE: f32 = 10.0;
const LINE_GAP: f32 = 6.0;
const CELL_LINE_HEIGHT: f32 = 4.5;
const CELL_PADDING: f32 = 2.0;

// Column edges in millimetres; the first column holds the wrapped product name.
const COLUMNS: [f32; 5] = [MARGIN, 90.0, 112.0, 147.0, 182.0];
const NAME_WRAP: usize = 36;
const HEADERS: [&str; 4] = ["Producto", "Cantidad", "Precio Unitario", "Subtotal"];

#[derive(Debug, Clone)]
pub struct InvoiceLine {
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
}

impl InvoiceLine {
    pub fn subtotal(&self) -> BigDecimal {
        &self.unit_price * BigDecimal::from(self.quantity)
    }
}

#[derive(Debug, Clone)]
pub struct InvoiceData {
    pub number: OrderNumber,
    pub customer_name: String,
    pub email: String,
    pub address: String,
    pub placed_at: DateTime<FixedOffset>,
    pub lines: Vec<InvoiceLine>,
    pub total: BigDecimal,
}

impl InvoiceData {
    pub fn new(order: &Order, user: &User, lines: Vec<(OrderLine, Product)>, offset: FixedOffset) -> Self {
        Self {
            number: order.number(),
            customer_name: user.full_name(),
            email: user.email.clone(),
            address: order.shipping_address.clone().unwrap_or_default(),
            placed_at: order.created_at.with_timezone(&offset),
            lines: lines
                .into_iter()
                .map(|(line, product)| InvoiceLine {
                    product_name: product.name,
                    quantity: line.quantity,
                    unit_price: line.unit_price,
                })
                .collect(),
            total: order.total.clone(),
        }
    }
}

/// Renders the invoice as an A4 PDF.
pub fn render_pdf(invoice: &InvoiceData) -> Result<Vec<u8>, StoreError> {
    let title = format!("Factura - Pedido #{}", invoice.number);
    let mut canvas = Canvas::new(&title)?;

    canvas.text(&title, TITLE_SIZE, MARGIN, true);
    canvas.advance(LINE_GAP * 2.0);
    for (label, value) in buyer_block(invoice) {
        canvas.labelled(label, &value);
    }
    canvas.advance(LINE_GAP);

    canvas.header_row();
    for line in &invoice.lines {
        let name = wrap(&line.product_name, NAME_WRAP);
        let cells = [
            line.quantity.to_string(),
            format_money(&line.unit_price),
            format_money(&line.subtotal()),
        ];
        canvas.row(&name, &cells, false);
    }
    canvas.row(
        &[String::new()],
        &[String::new(), "Total:".to_string(), format_money(&invoice.total)],
        true,
    );

    canvas
        .doc
        .save_to_bytes()
        .map_err(|e| StoreError::Render(e.to_string()))
}

fn buyer_block(invoice: &InvoiceData) -> [(&'static str, String); 4] {
    [
        ("Cliente:", invoice.customer_name.clone()),
        ("Email:", invoice.email.clone()),
        ("Dirección:", invoice.address.clone()),
        ("Fecha:", invoice.placed_at.format("%d/%m/%Y %H:%M").to_string()),
    ]
}

struct Canvas {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    y: f32,
    pages: usize,
}

impl Canvas {
    fn new(title: &str) -> Result<Self, StoreError> {
        let (doc, page, layer) = PdfDocument::new(title, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Pagina 1");
        let regular = doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(|e| StoreError::Render(e.to_string()))?;
        let bold = doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(|e| StoreError::Render(e.to_string()))?;
        let layer = doc.get_page(page).get_layer(layer);

        Ok(Self { doc, layer, regular, bold, y: TOP, pages: 1 })
    }

    fn text(&self, text: &str, size: f32, x: f32, bold: bool) {
        let font = if bold { &self.bold } else { &self.regular };
        self.layer.use_text(text, size, Mm(x), Mm(self.y), font);
    }

    fn labelled(&mut self, label: &str, value: &str) {
        self.text(label, TEXT_SIZE, MARGIN, true);
        self.text(value, TEXT_SIZE, MARGIN + 22.0, false);
        self.advance(LINE_GAP);
    }

    fn advance(&mut self, height: f32) {
        self.y -= height;
    }

    fn rule(&self, x1: f32, y1: f32, x2: f32, y2: f32) {
        self.layer.add_line(Line {
            points: vec![
                (Point::new(Mm(x1), Mm(y1)), false),
                (Point::new(Mm(x2), Mm(y2)), false),
            ],
            is_closed: false,
        });
    }

    fn new_page(&mut self) {
        self.pages += 1;
        let (page, layer) = self.doc.add_page(
            Mm(PAGE_WIDTH),
            Mm(PAGE_HEIGHT),
            format!("Pagina {}", self.pages),
        );
        self.layer = self.doc.get_page(page).get_layer(layer);
        self.y = TOP;
    }

    fn header_row(&mut self) {
        let headers = HEADERS.map(str::to_string);
        self.row(&headers[..1], &headers[1..], true);
    }

    /// Draws one table row: a (possibly wrapped) first cell and the
    /// remaining single-line cells. Starts a new page, repeating the header,
    /// when the row would cross the bottom margin.
    fn row(&mut self, first: &[String], rest: &[String], bold: bool) {
        let lines = first.len().max(1) as f32;
        let height = lines * CELL_LINE_HEIGHT + CELL_PADDING * 2.0;

        if self.y - height < MARGIN {
            self.new_page();
            self.header_row();
        }

        let top = self.y;
        let bottom = top - height;
        self.rule(COLUMNS[0], top, COLUMNS[4], top);
        self.rule(COLUMNS[0], bottom, COLUMNS[4], bottom);
        for x in COLUMNS {
            self.rule(x, top, x, bottom);
        }

        let size = CELL_SIZE;
        let font = if bold { self.bold.clone() } else { self.regular.clone() };
        let first_baseline = top - CELL_PADDING - CELL_LINE_HEIGHT + 1.0;
        for (i, text) in first.iter().enumerate() {
            let y = first_baseline - i as f32 * CELL_LINE_HEIGHT;
            self.layer.use_text(text.as_str(), size, Mm(COLUMNS[0] + CELL_PADDING), Mm(y), &font);
        }
        for (text, x) in rest.iter().zip(&COLUMNS[1..]) {
            self.layer.use_text(text.as_str(), size, Mm(x + CELL_PADDING), Mm(first_baseline), &font);
        }

        self.y = bottom;
    }
}

/// Splits `text` into lines of at most `width` characters, breaking on
/// whitespace and hard-splitting words that are longer than a line.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let rest = word.split_off(width);
            lines.push(word.into_iter().collect());
            word = rest;
        }

        let needed = if current.is_empty() { word.len() } else { current.chars().count() + 1 + word.len() };
        if needed > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.extend(word);
    }

    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

/// Where invoice PDFs live on disk and the URL they are served under.
#[derive(Debug, Clone)]
pub struct InvoiceStore {
    dir: PathBuf,
    url_prefix: String,
}

impl InvoiceStore {
    pub const SUBDIR: &'static str = "pedidos";
    pub const MEDIA_URL: &'static str = "/static/media";

    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        Self {
            dir: media_root.into().join(Self::SUBDIR),
            url_prefix: format!("{}/{}", Self::MEDIA_URL, Self::SUBDIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    pub fn path_for(&self, number: OrderNumber) -> PathBuf {
        self.dir.join(number.invoice_file_name())
    }

    pub fn url_for(&self, number: OrderNumber) -> String {
        format!("{}/{}", self.url_prefix, number.invoice_file_name())
    }

    /// Writes the PDF to a temporary file in the same directory and renames it
    /// into place, so concurrent renders of one order never interleave.
    pub async fn save(&self, number: OrderNumber, pdf: &[u8]) -> Result<PathBuf, StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Render(format!("creating {}: {}", self.dir.display(), e)))?;

        let path = self.path_for(number);
        let staging = self
            .dir
            .join(format!(".{}.{}.tmp", number.invoice_file_name(), Uuid::new_v4().simple()));

        tokio::fs::write(&staging, pdf)
            .await
            .map_err(|e| StoreError::Render(format!("writing {}: {}", staging.display(), e)))?;

        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(StoreError::Render(format!("moving {} into place: {}", path.display(), e)));
        }
        Ok(path)
    }
}
