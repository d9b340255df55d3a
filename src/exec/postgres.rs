//! PostgreSQL data sources over `deadpool-postgres` pools.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures_util::TryStreamExt;
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{NoTls, Row, RowStream};

use super::{Connection, DataSourceProvider, DriverResult, RowCursor};
use crate::error::{DriverError, ErrorCategory};
use crate::value::{CellValue, ColumnInfo, ColumnType};

/// SSL/TLS modes, matching libpq's `sslmode`:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

fn default_port() -> u16 {
    5432
}

fn default_pool_size() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Skip certificate verification in `Prefer`/`Require` modes.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// PEM file with the CA certificate(s) to trust, e.g. the AWS RDS
    /// global bundle.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            name: String::from("default"),
            host: String::from("localhost"),
            port: default_port(),
            database: String::from("postgres"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            pool_size: default_pool_size(),
        }
    }
}

impl DataSourceConfig {
    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }

    pub fn is_aws_rds_host(&self) -> bool {
        self.host.contains(".rds.amazonaws.com")
            || self.host.contains(".rds.cn-")
            || self.host.contains(".rds-fips.")
    }

    fn pg_config(&self) -> tokio_postgres::Config {
        let mut cfg = tokio_postgres::Config::new();
        cfg.host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.username)
            .connect_timeout(Duration::from_secs(10))
            .ssl_mode(match self.ssl_mode {
                SslMode::Disable => tokio_postgres::config::SslMode::Disable,
                SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
                SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                    tokio_postgres::config::SslMode::Require
                }
            });
        if !self.password.is_empty() {
            cfg.password(&self.password);
        }
        cfg
    }

    pub fn create_pool(&self) -> DriverResult<Pool> {
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = match self.ssl_mode {
            SslMode::Disable => Manager::from_config(self.pg_config(), NoTls, manager_config),
            SslMode::Prefer | SslMode::Require => Manager::from_config(
                self.pg_config(),
                build_tls_connector(self, false)?,
                manager_config,
            ),
            SslMode::VerifyCa | SslMode::VerifyFull => Manager::from_config(
                self.pg_config(),
                build_tls_connector(self, true)?,
                manager_config,
            ),
        };
        Pool::builder(manager)
            .max_size(self.pool_size.max(1))
            .build()
            .map_err(|e| DriverError::new(ErrorCategory::Connection, e.to_string()))
    }
}

fn tls_error(message: impl Into<String>) -> DriverError {
    DriverError::new(ErrorCategory::Connection, message)
}

/// TLS connector for a data source. `strict_verify` (verify-ca and
/// verify-full) ignores `accept_invalid_certs`.
fn build_tls_connector(config: &DataSourceConfig, strict_verify: bool) -> DriverResult<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let ca_data = std::fs::read(ca_path)
            .map_err(|e| tls_error(format!("Failed to read CA certificate file {}: {}", ca_path, e)))?;
        add_ca_certificates(&mut builder, &ca_data)?;
    } else if config.is_aws_rds_host() {
        tracing::warn!(
            host = %config.host,
            "RDS host without ca_cert_path; verifying against the system trust store"
        );
    }

    let connector = builder
        .build()
        .map_err(|e| tls_error(format!("Failed to build TLS connector: {}", e)))?;
    Ok(MakeTlsConnector::new(connector))
}

fn add_ca_certificates(builder: &mut native_tls::TlsConnectorBuilder, pem_data: &[u8]) -> DriverResult<()> {
    for block in pem_blocks(pem_data)? {
        let cert = native_tls::Certificate::from_pem(block.as_bytes())
            .map_err(|e| tls_error(format!("Failed to parse certificate: {}", e)))?;
        builder.add_root_certificate(cert);
    }
    Ok(())
}

/// Split a PEM bundle into one string per certificate.
fn pem_blocks(pem_data: &[u8]) -> DriverResult<Vec<String>> {
    let pem_str = std::str::from_utf8(pem_data)
        .map_err(|_| tls_error("CA certificate file is not valid UTF-8"))?;

    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut in_cert = false;
    for line in pem_str.lines() {
        if line.contains("-----BEGIN CERTIFICATE-----") {
            in_cert = true;
            current.clear();
        }
        if in_cert {
            current.push_str(line.trim());
            current.push('\n');
        }
        if line.contains("-----END CERTIFICATE-----") && in_cert {
            in_cert = false;
            blocks.push(std::mem::take(&mut current));
        }
    }
    if blocks.is_empty() {
        return Err(tls_error("No valid certificates found in PEM data"));
    }
    Ok(blocks)
}

/// Named pools. Each acquired connection runs inside its own transaction,
/// opened lazily by the first statement.
pub struct PgProvider {
    pools: HashMap<String, Pool>,
}

impl PgProvider {
    pub fn new(configs: &[DataSourceConfig]) -> DriverResult<Self> {
        let mut pools = HashMap::new();
        for config in configs {
            tracing::info!(data_source = %config.name, target = %config.display_string(), "creating pool");
            pools.insert(config.name.clone(), config.create_pool()?);
        }
        Ok(Self { pools })
    }
}

#[async_trait]
impl DataSourceProvider for PgProvider {
    async fn acquire(&self, data_source: &str) -> DriverResult<Box<dyn Connection>> {
        let pool = self.pools.get(data_source).ok_or_else(|| {
            DriverError::new(
                ErrorCategory::Connection,
                format!("data source `{}` is not configured", data_source),
            )
        })?;
        let client = tokio::time::timeout(Duration::from_secs(15), pool.get())
            .await
            .map_err(|_| tls_error("Connection timed out after 15s"))??;
        Ok(Box::new(PgConnection {
            client: Some(client),
            in_transaction: false,
        }))
    }
}

pub struct PgConnection {
    client: Option<Object>,
    in_transaction: bool,
}

impl PgConnection {
    fn client(&self) -> DriverResult<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| tls_error("connection already released"))
    }

    async fn begin(&mut self) -> DriverResult<()> {
        if !self.in_transaction {
            self.client()?.batch_execute("BEGIN").await?;
            self.in_transaction = true;
        }
        Ok(())
    }
}

fn sql_params(params: &[CellValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl Connection for PgConnection {
    async fn product_name(&mut self) -> DriverResult<String> {
        let row = self.client()?.query_one("SELECT version()", &[]).await?;
        Ok(row.try_get::<_, String>(0)?)
    }

    async fn query(&mut self, sql: &str, params: &[CellValue]) -> DriverResult<Box<dyn RowCursor>> {
        self.begin().await?;
        let client = self.client()?;
        let statement = client.prepare(sql).await?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| ColumnInfo::new(c.name(), c.type_().name()))
            .collect();
        let types = statement.columns().iter().map(|c| c.type_().clone()).collect();
        let stream = client.query_raw(&statement, sql_params(params)).await?;
        Ok(Box::new(PgCursor {
            columns,
            types,
            stream: Box::pin(stream),
        }))
    }

    async fn execute(&mut self, sql: &str, params: &[CellValue]) -> DriverResult<u64> {
        self.begin().await?;
        Ok(self.client()?.execute(sql, &sql_params(params)).await?)
    }

    async fn execute_batch(&mut self, sql: &str, rows: &[Vec<CellValue>]) -> DriverResult<u64> {
        self.begin().await?;
        let client = self.client()?;
        let statement = client.prepare(sql).await?;
        let bound: Vec<Vec<&(dyn ToSql + Sync)>> = rows.iter().map(|r| sql_params(r)).collect();
        // the client pipelines concurrent requests on one connection
        let counts = futures_util::future::try_join_all(
            bound.iter().map(|params| client.execute(&statement, params)),
        )
        .await?;
        Ok(counts.into_iter().sum())
    }

    async fn commit(&mut self) -> DriverResult<()> {
        if self.in_transaction {
            self.client()?.batch_execute("COMMIT").await?;
            self.in_transaction = false;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        if self.in_transaction {
            self.client()?.batch_execute("ROLLBACK").await?;
            self.in_transaction = false;
        }
        Ok(())
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if !self.in_transaction {
            return;
        }
        // uncommitted work is discarded before the client goes back to the pool
        if let (Some(client), Ok(handle)) = (self.client.take(), tokio::runtime::Handle::try_current()) {
            handle.spawn(async move {
                if let Err(e) = client.batch_execute("ROLLBACK").await {
                    tracing::warn!("rollback on release failed: {}", e);
                }
            });
        }
    }
}

struct PgCursor {
    columns: Vec<ColumnInfo>,
    types: Vec<Type>,
    stream: Pin<Box<RowStream>>,
}

#[async_trait]
impl RowCursor for PgCursor {
    fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    async fn next_row(&mut self) -> DriverResult<Option<Vec<CellValue>>> {
        let Some(row) = self.stream.as_mut().try_next().await? else {
            return Ok(None);
        };
        Ok(Some(
            self.types
                .iter()
                .enumerate()
                .map(|(idx, ty)| extract_value(&row, idx, ty))
                .collect(),
        ))
    }
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> CellValue {
    fn get<'a, T: tokio_postgres::types::FromSql<'a>>(row: &'a Row, idx: usize) -> Option<T> {
        row.try_get::<_, Option<T>>(idx).ok().flatten()
    }
    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx).map(CellValue::Bool),
        Type::INT2 => get::<i16>(row, idx).map(CellValue::Int16),
        Type::INT4 => get::<i32>(row, idx).map(CellValue::Int32),
        Type::INT8 => get::<i64>(row, idx).map(CellValue::Int64),
        Type::FLOAT4 => get::<f32>(row, idx).map(CellValue::Float32),
        Type::FLOAT8 => get::<f64>(row, idx).map(CellValue::Float64),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => {
            get::<String>(row, idx).map(CellValue::Text)
        }
        Type::BYTEA => get::<Vec<u8>>(row, idx).map(CellValue::Bytes),
        Type::DATE => get::<NaiveDate>(row, idx).map(CellValue::Date),
        Type::TIME => get::<NaiveTime>(row, idx).map(CellValue::Time),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx).map(CellValue::DateTime),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx).map(CellValue::TimestampTz),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx).map(CellValue::Json),
        Type::INT4_ARRAY => get::<Vec<Option<i32>>>(row, idx)
            .map(|v| CellValue::Array(v.into_iter().map(CellValue::from).collect())),
        Type::INT8_ARRAY => get::<Vec<Option<i64>>>(row, idx)
            .map(|v| CellValue::Array(v.into_iter().map(CellValue::from).collect())),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get::<Vec<Option<String>>>(row, idx)
            .map(|v| CellValue::Array(v.into_iter().map(CellValue::from).collect())),
        // numeric and anything else without a native mapping arrive as text
        _ => get::<String>(row, idx).map(CellValue::Text),
    };
    value.unwrap_or(CellValue::Null)
}

fn column_type_for(ty: &Type) -> Option<ColumnType> {
    Some(match *ty {
        Type::BOOL => ColumnType::Bool,
        Type::INT2 => ColumnType::Int16,
        Type::INT4 => ColumnType::Int32,
        Type::INT8 => ColumnType::Int64,
        Type::FLOAT4 | Type::FLOAT8 => ColumnType::Float64,
        Type::DATE => ColumnType::Date,
        Type::TIME => ColumnType::Time,
        Type::TIMESTAMP => ColumnType::DateTime,
        Type::TIMESTAMPTZ => ColumnType::TimestampTz,
        Type::JSON | Type::JSONB => ColumnType::Json,
        Type::BYTEA => ColumnType::Bytes,
        _ => return None,
    })
}

type BoxError = Box<dyn StdError + Sync + Send>;

/// Binary `numeric` wire form of a plain decimal string: digit count,
/// weight, sign and display scale, then base-10000 digit groups.
fn encode_numeric(text: &str, out: &mut BytesMut) -> Result<(), BoxError> {
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit())
        || (int_part.is_empty() && frac_part.is_empty())
    {
        return Err(format!("`{}` is not a plain decimal", text).into());
    }
    let int_digits = int_part.trim_start_matches('0');
    let int_pad = (4 - int_digits.len() % 4) % 4;
    let frac_pad = (4 - frac_part.len() % 4) % 4;
    let digits: Vec<u8> = std::iter::repeat(b'0')
        .take(int_pad)
        .chain(int_digits.bytes())
        .chain(frac_part.bytes())
        .chain(std::iter::repeat(b'0').take(frac_pad))
        .collect();
    let mut groups: Vec<i16> = digits
        .chunks(4)
        .map(|c| c.iter().fold(0i16, |acc, d| acc * 10 + i16::from(d - b'0')))
        .collect();
    let mut weight = ((int_pad + int_digits.len()) / 4) as i16 - 1;
    while groups.first() == Some(&0) {
        groups.remove(0);
        weight -= 1;
    }
    while groups.last() == Some(&0) {
        groups.pop();
    }
    if groups.is_empty() {
        weight = 0;
    }
    out.extend_from_slice(&(groups.len() as i16).to_be_bytes());
    out.extend_from_slice(&weight.to_be_bytes());
    let sign: u16 = if negative && !groups.is_empty() { 0x4000 } else { 0 };
    out.extend_from_slice(&sign.to_be_bytes());
    out.extend_from_slice(&(frac_part.len() as u16).to_be_bytes());
    for group in groups {
        out.extend_from_slice(&group.to_be_bytes());
    }
    Ok(())
}

fn mismatch(value: &CellValue, ty: &Type) -> BoxError {
    format!("cannot bind {:?} to a parameter of type {}", value, ty).into()
}

/// Values are converted to the parameter type the server inferred, so a
/// loosely typed value (an `Int64` for an `int4` column, an ISO string for
/// a date) binds without casts in the SQL.
impl ToSql for CellValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if self.is_null() {
            return Ok(IsNull::Yes);
        }
        let Some(target) = column_type_for(ty) else {
            return match self {
                CellValue::Array(items) => {
                    let texts: Vec<Option<String>> = items
                        .iter()
                        .map(|v| (!v.is_null()).then(|| v.display()))
                        .collect();
                    texts.to_sql(ty, out)
                }
                other => other.display().to_sql(ty, out),
            };
        };
        if *ty == Type::NUMERIC {
            return match self.as_f64() {
                Some(_) => {
                    encode_numeric(self.display().trim(), out)?;
                    Ok(IsNull::No)
                }
                None => Err(mismatch(self, ty)),
            };
        }
        match (target, self.clone().coerce(target)) {
            (ColumnType::Json, v) => v.to_json().to_sql(ty, out),
            (_, CellValue::Bool(b)) => b.to_sql(ty, out),
            (_, CellValue::Int16(i)) => i.to_sql(ty, out),
            (_, CellValue::Int32(i)) => i.to_sql(ty, out),
            (_, CellValue::Int64(i)) => i.to_sql(ty, out),
            (_, CellValue::Float64(f)) if *ty == Type::FLOAT4 => (f as f32).to_sql(ty, out),
            (_, CellValue::Float64(f)) => f.to_sql(ty, out),
            (_, CellValue::Date(d)) => d.to_sql(ty, out),
            (_, CellValue::Time(t)) => t.to_sql(ty, out),
            (ColumnType::TimestampTz, CellValue::DateTime(dt)) => dt.and_utc().to_sql(ty, out),
            (_, CellValue::DateTime(dt)) => dt.to_sql(ty, out),
            (_, CellValue::TimestampTz(dt)) => dt.to_sql(ty, out),
            (_, CellValue::Bytes(b)) => b.to_sql(ty, out),
            (_, v) => Err(mismatch(&v, ty)),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_source_defaults_from_toml() {
        let cfg: DataSourceConfig = toml::from_str(
            r#"
name = "orders"
host = "db.example.com"
database = "orders"
username = "app"
"#,
        )
        .unwrap();
        assert_eq!(cfg.port, 5432);
        assert_eq!(cfg.ssl_mode, SslMode::Prefer);
        assert_eq!(cfg.pool_size, 8);
        assert!(cfg.password.is_empty());
        assert_eq!(cfg.display_string(), "app@db.example.com:5432/orders");
    }

    #[test]
    fn test_aws_rds_detection() {
        let cfg = DataSourceConfig {
            host: "mydb.abc123.us-east-1.rds.amazonaws.com".into(),
            ..Default::default()
        };
        assert!(cfg.is_aws_rds_host());
        assert!(!DataSourceConfig::default().is_aws_rds_host());
    }

    #[test]
    fn test_pem_blocks() {
        let bundle = b"# comment
-----BEGIN CERTIFICATE-----
  QUJD
-----END CERTIFICATE-----
-----BEGIN CERTIFICATE-----
REVG
-----END CERTIFICATE-----
";
        let blocks = pem_blocks(bundle).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            blocks[0],
            "-----BEGIN CERTIFICATE-----\nQUJD\n-----END CERTIFICATE-----\n"
        );
        assert!(pem_blocks(b"not a certificate").is_err());
    }

    #[test]
    fn test_numeric_wire_form() {
        let mut buf = BytesMut::new();
        encode_numeric("-12345.678", &mut buf).unwrap();
        // 2 groups [1, 2345] before the point, [6780] after
        let expect: Vec<u8> = [3i16, 1, 0x4000, 3, 1, 2345, 6780]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();
        assert_eq!(&buf[..], &expect[..]);

        let mut zero = BytesMut::new();
        encode_numeric("0.00", &mut zero).unwrap();
        assert_eq!(&zero[..], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert!(encode_numeric("1e5", &mut zero).is_err());
    }

    #[test]
    fn test_loose_values_bind_to_server_types() {
        let mut buf = BytesMut::new();
        let is_null = CellValue::Int64(7).to_sql(&Type::INT4, &mut buf).unwrap();
        assert!(matches!(is_null, IsNull::No));
        assert_eq!(buf.len(), 4);

        let mut buf = BytesMut::new();
        CellValue::from("2024-03-01")
            .to_sql(&Type::DATE, &mut buf)
            .unwrap();
        assert_eq!(buf.len(), 4);

        let mut buf = BytesMut::new();
        assert!(matches!(
            CellValue::Null.to_sql(&Type::INT8, &mut buf).unwrap(),
            IsNull::Yes
        ));
        assert!(CellValue::from("abc").to_sql(&Type::INT4, &mut buf).is_err());
    }
}
