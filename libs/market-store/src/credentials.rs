//! Exchange credential rows. Key material is stored encrypted; this
//! module never sees plaintext — decryption happens inside the exchange
//! adapter layer.

use crate::models::DbCredential;
use crate::{retry_query, Result, TimeSeriesStore};

/// Encrypted credential material as written by the external API.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub owner_id: i64,
    pub exchange: String,
    pub testnet: bool,
    pub api_key: Vec<u8>,
    pub api_secret: Vec<u8>,
    pub passphrase: Option<Vec<u8>>,
}

impl TimeSeriesStore {
    pub async fn insert_credential(&self, new: &NewCredential) -> Result<i64> {
        retry_query!(sqlx::query(
            r#"
            INSERT INTO exchange_credentials
                (owner_id, exchange, testnet, api_key, api_secret, passphrase, active)
            VALUES (?, ?, ?, ?, ?, ?, 1)
            ON CONFLICT (owner_id, exchange, testnet)
            DO UPDATE SET api_key = excluded.api_key,
                          api_secret = excluded.api_secret,
                          passphrase = excluded.passphrase,
                          active = 1
            "#,
        )
        .bind(new.owner_id)
        .bind(&new.exchange)
        .bind(new.testnet)
        .bind(&new.api_key)
        .bind(&new.api_secret)
        .bind(&new.passphrase)
        .execute(self.pool()))?;

        // the upsert may have updated an existing row; fetch the id explicitly
        let (id,): (i64,) = sqlx::query_as(
            "SELECT id FROM exchange_credentials WHERE owner_id = ? AND exchange = ? AND testnet = ?",
        )
        .bind(new.owner_id)
        .bind(&new.exchange)
        .bind(new.testnet)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn credential(&self, id: i64) -> Result<Option<DbCredential>> {
        let row: Option<DbCredential> = sqlx::query_as(
            "SELECT id, owner_id, exchange, testnet, api_key, api_secret, passphrase, active \
             FROM exchange_credentials WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn deactivate_credential(&self, id: i64) -> Result<()> {
        retry_query!(sqlx::query("UPDATE exchange_credentials SET active = 0 WHERE id = ?")
            .bind(id)
            .execute(self.pool()))?;
        Ok(())
    }
}
