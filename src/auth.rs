use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

/// Who may connect: one staff account, and holders sharing a password.
#[derive(Debug, Clone)]
pub struct Access {
    pub password: String,
    pub staff_user: String,
    pub staff_password: String,
}

impl Access {
    pub fn is_staff(&self, user: &str) -> bool {
        user == self.staff_user
    }
}

#[derive(Debug)]
pub struct LarderAuthSource {
    access: Access,
}

impl LarderAuthSource {
    pub fn new(access: Access) -> Self {
        Self { access }
    }
}

#[async_trait]
impl AuthSource for LarderAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let Some(user) = login.user().filter(|u| !u.is_empty()) else {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "a user name is required".into(),
            ))));
        };
        let password = if self.access.is_staff(user) {
            &self.access.staff_password
        } else {
            &self.access.password
        };
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}
