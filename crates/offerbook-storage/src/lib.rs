//! SQLite-backed repository for products and vendor offers.

use std::str::FromStr;
use std::time::Duration;

use offerbook_core::{DateRange, NewOffer, NewProduct, Offer, Product, ProductPatch};
use sqlx::error::{DatabaseError, ErrorKind};
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{debug, error, info};

pub const CRATE_NAME: &str = "offerbook-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const PRODUCT_COLUMNS: &str = "prod_id, name, description";
const OFFER_COLUMNS: &str =
    "internal_id, vendor_id, price, items_in_stock, active, date_created, prod_id";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("value already exists")]
    Duplicate,
    #[error("integrity constraint violated")]
    Integrity,
    #[error("expected at most one {entity} row, found {found}")]
    Consistency { entity: &'static str, found: usize },
    #[error("storage error: {0}")]
    Sql(#[source] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] MigrateError),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err.as_database_error().map(DatabaseError::kind) {
            Some(ErrorKind::UniqueViolation) => Self::Duplicate,
            Some(
                ErrorKind::CheckViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::ForeignKeyViolation,
            ) => Self::Integrity,
            _ => Self::Sql(err),
        }
    }
}

/// Which offers a listing should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferFilter {
    All,
    Active,
    Product(i64),
    Vendor(i64),
    Pair { prod_id: i64, vendor_id: i64 },
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Opens (creating if missing) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Opens a write transaction (`BEGIN IMMEDIATE`).
    ///
    /// The write lock is taken up front, so a concurrent writer makes this
    /// wait on `busy_timeout` instead of failing a later read-to-write upgrade.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StorageError> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    pub async fn insert_product(&self, product: &NewProduct) -> Result<Product, StorageError> {
        let row = sqlx::query(&format!(
            "INSERT INTO products (name, description) VALUES (?, ?) RETURNING {PRODUCT_COLUMNS}"
        ))
        .bind(product.name())
        .bind(product.description())
        .fetch_one(&self.pool)
        .await?;
        let created = product_from_row(&row)?;
        info!(prod_id = created.prod_id, name = %created.name, "product added");
        Ok(created)
    }

    pub async fn find_product(&self, prod_id: i64) -> Result<Option<Product>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE prod_id = ?"
        ))
        .bind(prod_id)
        .fetch_all(&self.pool)
        .await?;
        let found = at_most_one("product", map_rows(&rows, product_from_row)?)?;
        if found.is_none() {
            debug!(prod_id, "product not found");
        }
        Ok(found)
    }

    pub async fn find_product_by_name(&self, name: &str) -> Result<Option<Product>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE name = ?"
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        at_most_one("product", map_rows(&rows, product_from_row)?)
    }

    pub async fn list_products(&self) -> Result<Vec<Product>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY prod_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        map_rows(&rows, product_from_row)
    }

    /// Applies `patch` and returns the updated row, or `None` if no such product.
    pub async fn update_product(
        &self,
        prod_id: i64,
        patch: &ProductPatch,
    ) -> Result<Option<Product>, StorageError> {
        if patch.is_empty() {
            return self.find_product(prod_id).await;
        }
        let row = sqlx::query(&format!(
            "UPDATE products
                SET name = COALESCE(?, name),
                    description = COALESCE(?, description)
              WHERE prod_id = ?
          RETURNING {PRODUCT_COLUMNS}"
        ))
        .bind(patch.name.as_deref())
        .bind(patch.description.as_deref())
        .bind(prod_id)
        .fetch_optional(&self.pool)
        .await?;
        let updated = row.as_ref().map(product_from_row).transpose()?;
        if let Some(product) = &updated {
            info!(
                prod_id,
                name = ?patch.name,
                description = ?patch.description,
                "product updated"
            );
            debug!(?product, "product after update");
        }
        Ok(updated)
    }

    /// Returns whether a row was removed. Offers of the product are kept.
    pub async fn delete_product(&self, prod_id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM products WHERE prod_id = ?")
            .bind(prod_id)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(prod_id, "product deleted");
        } else {
            debug!(prod_id, "nothing to delete");
        }
        Ok(deleted)
    }

    pub async fn list_offers(&self, filter: OfferFilter) -> Result<Vec<Offer>, StorageError> {
        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {OFFER_COLUMNS} FROM offers"));
        match filter {
            OfferFilter::All => {}
            OfferFilter::Active => {
                query.push(" WHERE active = 1");
            }
            OfferFilter::Product(prod_id) => {
                query.push(" WHERE prod_id = ").push_bind(prod_id);
            }
            OfferFilter::Vendor(vendor_id) => {
                query.push(" WHERE vendor_id = ").push_bind(vendor_id);
            }
            OfferFilter::Pair { prod_id, vendor_id } => {
                query
                    .push(" WHERE prod_id = ")
                    .push_bind(prod_id)
                    .push(" AND vendor_id = ")
                    .push_bind(vendor_id);
            }
        }
        query.push(" ORDER BY date_created, internal_id");
        let rows = query.build().fetch_all(&self.pool).await?;
        map_rows(&rows, offer_from_row)
    }

    /// Offers of one pair created inside `range` (inclusive), oldest first.
    pub async fn offers_between(
        &self,
        prod_id: i64,
        vendor_id: i64,
        range: &DateRange,
    ) -> Result<Vec<Offer>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {OFFER_COLUMNS} FROM offers
              WHERE prod_id = ? AND vendor_id = ?
                AND date_created >= ? AND date_created <= ?
              ORDER BY date_created ASC, internal_id ASC"
        ))
        .bind(prod_id)
        .bind(vendor_id)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        map_rows(&rows, offer_from_row)
    }

    pub async fn find_active_offer(
        &self,
        prod_id: i64,
        vendor_id: i64,
    ) -> Result<Option<Offer>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        find_active_offer_in(&mut conn, prod_id, vendor_id).await
    }

    /// Administrative bulk purge; the only path that removes offers.
    pub async fn purge_offers(&self) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM offers").execute(&self.pool).await?;
        info!(deleted = result.rows_affected(), "offer history purged");
        Ok(result.rows_affected())
    }
}

/// Active offer of a pair on an open connection or transaction.
///
/// More than one active row is reported as [`StorageError::Consistency`] and
/// never repaired here.
pub async fn find_active_offer_in(
    conn: &mut SqliteConnection,
    prod_id: i64,
    vendor_id: i64,
) -> Result<Option<Offer>, StorageError> {
    let rows = sqlx::query(&format!(
        "SELECT {OFFER_COLUMNS} FROM offers
          WHERE prod_id = ? AND vendor_id = ? AND active = 1"
    ))
    .bind(prod_id)
    .bind(vendor_id)
    .fetch_all(&mut *conn)
    .await?;
    let offers = map_rows(&rows, offer_from_row)?;
    at_most_one("active offer", offers).inspect_err(|err| {
        error!(prod_id, vendor_id, %err, "active offer invariant violated");
    })
}

/// Clears the active flag; false when the row was already inactive.
pub async fn deactivate_offer_in(
    conn: &mut SqliteConnection,
    internal_id: i64,
) -> Result<bool, StorageError> {
    let result = sqlx::query("UPDATE offers SET active = 0 WHERE internal_id = ? AND active = 1")
        .bind(internal_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn insert_offer_in(
    conn: &mut SqliteConnection,
    offer: &NewOffer,
) -> Result<Offer, StorageError> {
    let row = sqlx::query(&format!(
        "INSERT INTO offers (vendor_id, price, items_in_stock, active, date_created, prod_id)
         VALUES (?, ?, ?, 1, ?, ?)
         RETURNING {OFFER_COLUMNS}"
    ))
    .bind(offer.vendor_id)
    .bind(offer.price)
    .bind(offer.items_in_stock)
    .bind(offer.date_created)
    .bind(offer.prod_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(offer_from_row(&row)?)
}

fn at_most_one<T>(entity: &'static str, mut rows: Vec<T>) -> Result<Option<T>, StorageError> {
    match rows.len() {
        0 | 1 => Ok(rows.pop()),
        found => Err(StorageError::Consistency { entity, found }),
    }
}

fn map_rows<T>(
    rows: &[SqliteRow],
    map: fn(&SqliteRow) -> sqlx::Result<T>,
) -> Result<Vec<T>, StorageError> {
    rows.iter()
        .map(|row| map(row).map_err(StorageError::Sql))
        .collect()
}

fn product_from_row(row: &SqliteRow) -> sqlx::Result<Product> {
    Ok(Product {
        prod_id: row.try_get("prod_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
    })
}

fn offer_from_row(row: &SqliteRow) -> sqlx::Result<Offer> {
    Ok(Offer {
        internal_id: row.try_get("internal_id")?,
        vendor_id: row.try_get("vendor_id")?,
        price: row.try_get("price")?,
        items_in_stock: row.try_get("items_in_stock")?,
        active: row.try_get("active")?,
        date_created: row.try_get("date_created")?,
        prod_id: row.try_get("prod_id")?,
    })
}
