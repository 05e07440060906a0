//! Remember-me tokens. A token is a series id plus a validator secret;
//! the cookie carries `series|validator`, the store only ever sees the
//! SHA-256 of the validator. Validation failures are silent to the caller
//! and reported to the unsuccessful-access counter, whose lockout policy
//! is external.

use crate::prelude::*;

use openssl::hash::{hash, MessageDigest};
use openssl::memcmp;

use crate::stores::{EntityDirectory, SessionStore, TokenStore, UnsuccessfulAccessCounter};

const COOKIE_DELIMITER: char = '|';
const SECONDS_PER_DAY: i64 = 86_400;

/// The result of validating a remember-me cookie. `session` is present
/// only on success; `cookie` carries a rotation or removal instruction for
/// the transport and may be present either way.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub session: Option<LoginSession>,
    pub cookie: Option<CookieCommand>,
}

impl ValidationOutcome {
    fn invalid() -> Self {
        ValidationOutcome::default()
    }

    fn removal(realm_name: &str) -> Self {
        ValidationOutcome {
            session: None,
            cookie: Some(CookieCommand::Remove {
                name: remember_me_cookie_name(realm_name),
            }),
        }
    }
}

enum TokenCheck {
    Invalid(ValidationOutcome),
    Valid {
        series_id: String,
        record: RememberMeTokenRecord,
    },
}

pub struct RememberMeTokenService {
    tokens: Arc<dyn TokenStore>,
    sessions: Arc<dyn SessionStore>,
    directory: Arc<dyn EntityDirectory>,
}

impl RememberMeTokenService {
    pub fn new(
        tokens: Arc<dyn TokenStore>,
        sessions: Arc<dyn SessionStore>,
        directory: Arc<dyn EntityDirectory>,
    ) -> Self {
        RememberMeTokenService {
            tokens,
            sessions,
            directory,
        }
    }

    /// Issue a token for a completed authentication. Returns the cookie to
    /// set, or `None` when the realm disallows remembering.
    pub fn issue(
        &self,
        realm: &AuthenticationRealm,
        machine: &LoginMachineDetails,
        entity_id: Uuid,
        issued_at: OffsetDateTime,
        first_factor_option: &AuthenticationOptionKey,
        second_factor_option: Option<&AuthenticationOptionKey>,
    ) -> Result<Option<CookieCommand>, OperationError> {
        if realm.remember_me_policy == RememberMePolicy::Disallow {
            return Ok(None);
        }

        let series_id = Uuid::new_v4().to_string();
        let validator = Uuid::new_v4().to_string();
        let lifetime = time::Duration::days(i64::from(realm.remember_me_for_days));

        let record = RememberMeTokenRecord {
            entity_id,
            realm: realm.name.clone(),
            policy: realm.remember_me_policy,
            validator_hash: validator_hash(&validator)?,
            first_factor_option: first_factor_option.clone(),
            second_factor_option: second_factor_option.cloned(),
            machine: machine.clone(),
            issued_at,
            expires: issued_at + lifetime,
        };
        let contents =
            serde_json::to_vec(&record).map_err(|_| OperationError::SerdeJsonError)?;
        self.tokens
            .put(REMEMBER_ME_TOKEN_TYPE, &series_id, &contents, record.expires)?;

        security_info!(%entity_id, realm = %realm.name, "issued remember-me token");
        Ok(Some(CookieCommand::Set {
            name: remember_me_cookie_name(&realm.name),
            value: format!("{}{}{}", series_id, COOKIE_DELIMITER, validator),
            max_age_seconds: i64::from(realm.remember_me_for_days) * SECONDS_PER_DAY,
        }))
    }

    /// Validate a cookie against the whole-authentication policy. Success
    /// yields a session with both factors marked skipped, and a rotated
    /// cookie.
    pub fn validate_whole_authn(
        &self,
        cookie_value: &str,
        realm: &AuthenticationRealm,
        source_ip: &str,
        counter: &dyn UnsuccessfulAccessCounter,
        now: OffsetDateTime,
    ) -> Result<ValidationOutcome, OperationError> {
        if realm.remember_me_policy != RememberMePolicy::AllowForWholeAuthn {
            return Ok(ValidationOutcome::invalid());
        }
        let check = self.check_token(cookie_value, realm, source_ip, counter, now)?;
        let (series_id, record) = match check {
            TokenCheck::Invalid(outcome) => return Ok(outcome),
            TokenCheck::Valid { series_id, record } => (series_id, record),
        };

        let info = RememberMeInfo {
            first_factor_skipped: true,
            second_factor_skipped: true,
        };
        self.complete(series_id, record, realm, info, now)
    }

    /// Validate a cookie as a replacement for the second factor only. The
    /// entity authenticated by the first factor must own the token.
    pub fn validate_second_factor(
        &self,
        cookie_value: &str,
        realm: &AuthenticationRealm,
        expected_entity_id: Uuid,
        source_ip: &str,
        counter: &dyn UnsuccessfulAccessCounter,
        now: OffsetDateTime,
    ) -> Result<ValidationOutcome, OperationError> {
        if realm.remember_me_policy == RememberMePolicy::Disallow {
            return Ok(ValidationOutcome::invalid());
        }
        let check = self.check_token(cookie_value, realm, source_ip, counter, now)?;
        let (series_id, record) = match check {
            TokenCheck::Invalid(outcome) => return Ok(outcome),
            TokenCheck::Valid { series_id, record } => (series_id, record),
        };

        if record.entity_id != expected_entity_id {
            security_error!(
                expected = %expected_entity_id,
                token_owner = %record.entity_id,
                %source_ip,
                "remember-me token owned by a different entity"
            );
            counter.record_failure(source_ip);
            return Ok(ValidationOutcome::invalid());
        }

        let info = RememberMeInfo {
            first_factor_skipped: false,
            second_factor_skipped: true,
        };
        self.complete(series_id, record, realm, info, now)
    }

    /// Shared validation steps up to, but not including, session creation.
    fn check_token(
        &self,
        cookie_value: &str,
        realm: &AuthenticationRealm,
        source_ip: &str,
        counter: &dyn UnsuccessfulAccessCounter,
        now: OffsetDateTime,
    ) -> Result<TokenCheck, OperationError> {
        // Malformed cookies never reach storage.
        let Some((series_id, validator)) = split_cookie(cookie_value) else {
            security_info!(%source_ip, "malformed remember-me cookie");
            counter.record_failure(source_ip);
            return Ok(TokenCheck::Invalid(ValidationOutcome::invalid()));
        };

        let Some(contents) = self.tokens.get(REMEMBER_ME_TOKEN_TYPE, series_id)? else {
            trace!(%series_id, "remember-me token absent");
            return Ok(TokenCheck::Invalid(ValidationOutcome::removal(&realm.name)));
        };

        let record: RememberMeTokenRecord = match serde_json::from_slice(&contents) {
            Ok(record) => record,
            Err(e) => {
                admin_error!(%series_id, err = %e, "undecodable remember-me record, dropping");
                self.tokens.delete(REMEMBER_ME_TOKEN_TYPE, series_id)?;
                return Ok(TokenCheck::Invalid(ValidationOutcome::removal(&realm.name)));
            }
        };

        if record.expires <= now {
            trace!(%series_id, "remember-me token expired");
            self.tokens.delete(REMEMBER_ME_TOKEN_TYPE, series_id)?;
            return Ok(TokenCheck::Invalid(ValidationOutcome::removal(&realm.name)));
        }

        // Validator mismatch is the tamper/replay signal. The token stays
        // on record so repeated guessing keeps feeding the counter.
        if !validator_matches(validator, &record.validator_hash)? {
            security_error!(%series_id, %source_ip, "remember-me validator mismatch");
            counter.record_failure(source_ip);
            return Ok(TokenCheck::Invalid(ValidationOutcome::invalid()));
        }

        // A token issued under a different realm or an older realm policy
        // is no longer honoured, and proactively revoked.
        if record.realm != realm.name || record.policy != realm.remember_me_policy {
            security_info!(
                %series_id,
                token_realm = %record.realm,
                "remember-me token incompatible with current realm policy, revoking"
            );
            self.tokens.delete(REMEMBER_ME_TOKEN_TYPE, series_id)?;
            return Ok(TokenCheck::Invalid(ValidationOutcome::removal(&realm.name)));
        }

        Ok(TokenCheck::Valid {
            series_id: series_id.to_string(),
            record,
        })
    }

    /// Rotate the validator and create the session seeded from the token.
    fn complete(
        &self,
        series_id: String,
        record: RememberMeTokenRecord,
        realm: &AuthenticationRealm,
        info: RememberMeInfo,
        now: OffsetDateTime,
    ) -> Result<ValidationOutcome, OperationError> {
        let txn = self.directory.read()?;
        if !txn.is_enabled(record.entity_id)? {
            security_info!(entity_id = %record.entity_id, "remember-me login for disabled entity, revoking");
            self.tokens.delete(REMEMBER_ME_TOKEN_TYPE, &series_id)?;
            return Ok(ValidationOutcome::removal(&realm.name));
        }
        let label = txn.entity_label(record.entity_id).unwrap_or_default();
        drop(txn);

        let validator = Uuid::new_v4().to_string();
        let lifetime = time::Duration::days(i64::from(realm.remember_me_for_days));
        let rotated = RememberMeTokenRecord {
            validator_hash: validator_hash(&validator)?,
            expires: now + lifetime,
            ..record
        };
        let contents =
            serde_json::to_vec(&rotated).map_err(|_| OperationError::SerdeJsonError)?;
        match self
            .tokens
            .update(REMEMBER_ME_TOKEN_TYPE, &series_id, &contents, rotated.expires)
        {
            Ok(()) => {}
            // A racing revoke between lookup and rotation. The token is
            // gone, so the validation reads as invalid, never as a fault.
            Err(OperationError::NoMatchingEntries) => {
                security_info!(%series_id, "remember-me token revoked during validation");
                return Ok(ValidationOutcome::invalid());
            }
            Err(e) => return Err(e),
        }

        let session = self.sessions.create_session(
            rotated.entity_id,
            realm,
            &label,
            None,
            info,
            &rotated.first_factor_option,
            rotated.second_factor_option.as_ref(),
        )?;

        security_access!(
            entity_id = %rotated.entity_id,
            realm = %realm.name,
            first_factor_skipped = session.remember_me_info.first_factor_skipped,
            "remember-me login"
        );
        Ok(ValidationOutcome {
            session: Some(session),
            cookie: Some(CookieCommand::Set {
                name: remember_me_cookie_name(&realm.name),
                value: format!("{}{}{}", series_id, COOKIE_DELIMITER, validator),
                max_age_seconds: i64::from(realm.remember_me_for_days) * SECONDS_PER_DAY,
            }),
        })
    }

    /// Remove a stored token. Revoking an absent token is not an error.
    pub fn revoke(&self, series_id: &str) -> Result<(), OperationError> {
        self.tokens.delete(REMEMBER_ME_TOKEN_TYPE, series_id)
    }

    /// Remove all tokens issued under a realm, for realm deletion or a
    /// policy change that invalidates outstanding tokens wholesale.
    pub fn revoke_all_for_realm(&self, realm_name: &str) -> Result<(), OperationError> {
        for (series_id, contents) in self.tokens.list_by_type(REMEMBER_ME_TOKEN_TYPE)? {
            match serde_json::from_slice::<RememberMeTokenRecord>(&contents) {
                Ok(record) if record.realm == realm_name => {
                    self.tokens.delete(REMEMBER_ME_TOKEN_TYPE, &series_id)?;
                }
                Ok(_) => {}
                Err(e) => {
                    admin_warn!(%series_id, err = %e, "undecodable remember-me record, dropping");
                    self.tokens.delete(REMEMBER_ME_TOKEN_TYPE, &series_id)?;
                }
            }
        }
        Ok(())
    }
}

fn split_cookie(cookie_value: &str) -> Option<(&str, &str)> {
    let mut parts = cookie_value.split(COOKIE_DELIMITER);
    let series_id = parts.next()?;
    let validator = parts.next()?;
    if parts.next().is_some() || series_id.is_empty() || validator.is_empty() {
        return None;
    }
    Some((series_id, validator))
}

fn validator_hash(validator: &str) -> Result<String, OperationError> {
    hash(MessageDigest::sha256(), validator.as_bytes())
        .map(hex::encode)
        .map_err(|_| OperationError::CryptographyError)
}

/// Constant-time comparison of the supplied validator against the stored
/// hash.
fn validator_matches(validator: &str, stored_hash: &str) -> Result<bool, OperationError> {
    let supplied = validator_hash(validator)?;
    if supplied.len() != stored_hash.len() {
        return Ok(false);
    }
    Ok(memcmp::eq(supplied.as_bytes(), stored_hash.as_bytes()))
}
