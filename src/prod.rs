use crate::db::{job_exists, DbHandle};
use crate::limits::{
    check_len, ABC_NAME_MAX, MATCH_MAX, PROFILE_NAME_MAX, PROFILE_TYPEID_MAX, VERSION_MAX,
};
use crate::{NewProduct, Product, SchedError, SchedResult};
use futures::TryStreamExt;
use sqlx::SqliteConnection;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, instrument};

const PROD_COLUMNS: &str = "id, job_id, seq_id, profile_name, abc_name, alt_loglik, null_loglik, \
    profile_typeid, version, match_data";

/// Append-only store of scoring results. A sequence holds at most one product
/// per profile.
#[derive(Clone)]
pub struct ProductStore {
    db: DbHandle,
}

impl ProductStore {
    pub fn new(db: DbHandle) -> Self {
        ProductStore { db }
    }

    /// Records one product. The sequence must belong to the product's job.
    #[instrument(name = "prod.add", skip_all, fields(job_id = prod.job_id, seq_id = prod.seq_id))]
    pub async fn add(&self, prod: &NewProduct) -> SchedResult<Product> {
        check_product(prod)?;
        let mut conn = self.db.pool().acquire().await?;
        let id = insert(&mut *conn, prod).await?;
        debug!(prod_id = id, "Product added");
        Ok(stored(id, prod))
    }

    pub async fn get(&self, prod_id: i64) -> SchedResult<Product> {
        sqlx::query_as::<_, Product>(&format!("SELECT {} FROM prod WHERE id = ?", PROD_COLUMNS))
            .bind(prod_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| SchedError::not_found(format!("product {}", prod_id)))
    }

    pub async fn get_all<F>(&self, job_id: i64, mut cb: F) -> SchedResult<()>
    where
        F: FnMut(Product),
    {
        if !job_exists(self.db.pool(), job_id).await? {
            return Err(SchedError::not_found(format!("job {}", job_id)));
        }
        let sql = format!("SELECT {} FROM prod WHERE job_id = ? ORDER BY id", PROD_COLUMNS);
        let mut rows = sqlx::query_as::<_, Product>(&sql)
            .bind(job_id)
            .fetch(self.db.pool());
        while let Some(prod) = rows.try_next().await? {
            cb(prod);
        }
        Ok(())
    }

    /// Imports a tab-separated product file in the slot report format. Either
    /// every row is stored or none is; a row that is already recorded fails
    /// the import with `InvalidState`. Returns the number of products imported.
    #[instrument(name = "prod.add_file", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn add_file(&self, path: impl AsRef<Path>) -> SchedResult<u64> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        let mut lines = BufReader::new(file).lines();
        let mut tx = self.db.pool().begin().await?;

        let mut count = 0u64;
        let mut lineno = 0usize;
        while let Some(line) = lines.next_line().await? {
            lineno += 1;
            if line.is_empty() {
                continue;
            }
            let prod = parse_record(&line, lineno)?;
            check_product(&prod)?;
            insert(&mut *tx, &prod).await?;
            count += 1;
        }

        tx.commit().await?;
        info!(count, "Products imported");
        Ok(count)
    }
}

/// Limits and separator checks on the fields that precede the match column.
pub(crate) fn check_header(prod: &NewProduct) -> SchedResult<()> {
    let fields = [
        ("profile name", &prod.profile_name, PROFILE_NAME_MAX),
        ("abc name", &prod.abc_name, ABC_NAME_MAX),
        ("profile typeid", &prod.profile_typeid, PROFILE_TYPEID_MAX),
        ("version", &prod.version, VERSION_MAX),
    ];
    for (field, value, max) in fields {
        check_len(field, value, max)?;
        if value.contains(['\t', '\n', '\r']) {
            return Err(SchedError::invalid(format!("{} contains a tab or line break", field)));
        }
    }
    Ok(())
}

fn check_product(prod: &NewProduct) -> SchedResult<()> {
    check_header(prod)?;
    check_len("match", &prod.match_data, MATCH_MAX)?;
    if prod.match_data.contains(['\n', '\r']) {
        return Err(SchedError::invalid("match contains a line break"));
    }
    Ok(())
}

/// Inserts `prod` only if its sequence is owned by its job and has no product
/// for the same profile yet, in one statement.
async fn insert(conn: &mut SqliteConnection, prod: &NewProduct) -> SchedResult<i64> {
    let result = sqlx::query(
        "INSERT INTO prod (job_id, seq_id, profile_name, abc_name, alt_loglik, null_loglik, \
            profile_typeid, version, match_data) \
        SELECT ?, ?, ?, ?, ?, ?, ?, ?, ? \
        WHERE EXISTS (SELECT 1 FROM seq WHERE id = ? AND job_id = ?) \
        AND NOT EXISTS (SELECT 1 FROM prod WHERE seq_id = ? AND profile_name = ?)",
    )
    .bind(prod.job_id)
    .bind(prod.seq_id)
    .bind(&prod.profile_name)
    .bind(&prod.abc_name)
    .bind(prod.alt_loglik)
    .bind(prod.null_loglik)
    .bind(&prod.profile_typeid)
    .bind(&prod.version)
    .bind(&prod.match_data)
    .bind(prod.seq_id)
    .bind(prod.job_id)
    .bind(prod.seq_id)
    .bind(&prod.profile_name)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        let owned: Option<i64> = sqlx::query_scalar("SELECT id FROM seq WHERE id = ? AND job_id = ?")
            .bind(prod.seq_id)
            .bind(prod.job_id)
            .fetch_optional(&mut *conn)
            .await?;
        return Err(match owned {
            Some(_) => SchedError::state(format!(
                "sequence {} already has a product for {}",
                prod.seq_id, prod.profile_name
            )),
            None => SchedError::invalid(format!(
                "sequence {} does not belong to job {}",
                prod.seq_id, prod.job_id
            )),
        });
    }
    Ok(result.last_insert_rowid())
}

fn stored(id: i64, prod: &NewProduct) -> Product {
    Product {
        id,
        job_id: prod.job_id,
        seq_id: prod.seq_id,
        profile_name: prod.profile_name.clone(),
        abc_name: prod.abc_name.clone(),
        alt_loglik: prod.alt_loglik,
        null_loglik: prod.null_loglik,
        profile_typeid: prod.profile_typeid.clone(),
        version: prod.version.clone(),
        match_data: prod.match_data.clone(),
    }
}

/// Parses one line of a product file:
/// `job_id seq_id profile_name abc_name alt_loglik null_loglik profile_typeid version match`,
/// tab separated. The match column runs to the end of the line.
pub fn parse_record(line: &str, lineno: usize) -> SchedResult<NewProduct> {
    let parse_err = |reason: String| SchedError::Parse {
        line: lineno,
        reason,
    };

    let fields: Vec<&str> = line.splitn(9, '\t').collect();
    if fields.len() != 9 {
        return Err(parse_err(format!("expected 9 fields, found {}", fields.len())));
    }

    let int = |i: usize, name: &str| {
        fields[i]
            .parse::<i64>()
            .map_err(|e| parse_err(format!("{}: {}", name, e)))
    };
    let float = |i: usize, name: &str| {
        fields[i]
            .parse::<f64>()
            .map_err(|e| parse_err(format!("{}: {}", name, e)))
    };

    Ok(NewProduct {
        job_id: int(0, "job_id")?,
        seq_id: int(1, "seq_id")?,
        profile_name: fields[2].to_string(),
        abc_name: fields[3].to_string(),
        alt_loglik: float(4, "alt_loglik")?,
        null_loglik: float(5, "null_loglik")?,
        profile_typeid: fields[6].to_string(),
        version: fields[7].to_string(),
        match_data: fields[8].to_string(),
    })
}
