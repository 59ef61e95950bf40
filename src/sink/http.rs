//! ClickHouse HTTP interface, rows sent as `JSONEachRow`
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::Sink;
use crate::error::SinkError;

pub struct HttpSink {
    client: Client,
    url: String,
    database: Option<String>,
    user: Option<String>,
    password: Option<String>,
}

impl HttpSink {
    /// `timeout` bounds a whole insert request, a hung server surfaces as a failed write
    pub fn new(
        url: &str,
        database: Option<String>,
        user: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<HttpSink, SinkError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(HttpSink {
            client,
            url: url.to_owned(),
            database,
            user,
            password,
        })
    }
}

fn insert_query(table: &str) -> String {
    format!("INSERT INTO {table} FORMAT JSONEachRow")
}

/// One JSON document per line
fn encode_rows<E: Serialize>(rows: &[E]) -> Result<Vec<u8>, SinkError> {
    let mut body = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut body, row)?;
        body.push(b'\n');
    }
    Ok(body)
}

#[async_trait]
impl<E: Serialize + Send + Sync> Sink<E> for HttpSink {
    async fn write(&self, table: &str, rows: &[E]) -> Result<(), SinkError> {
        let body = encode_rows(rows)?;
        let mut request = self
            .client
            .post(&self.url)
            .query(&[("query", insert_query(table))]);
        if let Some(database) = &self.database {
            request = request.query(&[("database", database)]);
        }
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }
        let response = request.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                table: table.to_owned(),
                status: status.as_u16(),
                body: body.trim().to_owned(),
            });
        }
        Ok(())
    }
}
