use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// Operator password checked during the Postgres startup handshake. Students authenticate
/// afterwards with session tokens, so every connection shares this one secret.
#[derive(Debug)]
pub struct EnrolldAuthSource {
    operator_password: Vec<u8>,
}

impl EnrolldAuthSource {
    pub fn new(operator_password: String) -> Self {
        Self {
            operator_password: operator_password.into_bytes(),
        }
    }
}

#[async_trait]
impl AuthSource for EnrolldAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!(user = ?login.user(), database = ?login.database(), "startup authentication");
        Ok(Password::new(None, self.operator_password.clone()))
    }
}
