use crate::{
    config::AdmissionConfig,
    error::{ApiError, Result},
    models::balance::BalanceInfo,
};
use entity::sea_orm_active_enums::ApplicationStatus;
use sea_orm::{entity::*, query::*, ConnectionTrait, DatabaseConnection};
use tracing::{debug, instrument};

/// What admission needs to know about one user, read in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageSnapshot {
    /// Memory held by pending and running applications
    pub used_mb: i32,
    pub credits: i32,
    /// Credit held back by deploys that are still in flight
    pub reserved_credits: i32,
}

impl UsageSnapshot {
    pub fn available_credits(&self) -> i32 {
        (self.credits - self.reserved_credits).max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub admitted: bool,
    /// Credit the request would consume; reported even when denied
    pub credit_deficit: i32,
    pub free_available_mb: i32,
}

pub struct AdmissionService {
    db: DatabaseConnection,
    free_allowance_mb: i32,
}

impl AdmissionService {
    pub fn new(db: DatabaseConnection, config: &AdmissionConfig) -> Self {
        Self {
            db,
            free_allowance_mb: config.free_allowance_mb,
        }
    }

    /// Decide whether `requested_mb` may be granted. Pure: nothing is
    /// reserved or debited here.
    pub fn evaluate(&self, usage: &UsageSnapshot, requested_mb: i32) -> Result<AdmissionDecision> {
        if requested_mb <= 0 {
            return Err(ApiError::InvalidRequest(format!(
                "Requested memory must be positive, got {requested_mb} MB"
            )));
        }

        let free_available_mb = (self.free_allowance_mb - usage.used_mb).max(0);

        if requested_mb <= free_available_mb {
            return Ok(AdmissionDecision {
                admitted: true,
                credit_deficit: 0,
                free_available_mb,
            });
        }

        let credit_deficit = requested_mb - free_available_mb;
        Ok(AdmissionDecision {
            admitted: usage.available_credits() >= credit_deficit,
            credit_deficit,
            free_available_mb,
        })
    }

    /// Read the user's usage through `conn`, which is a transaction when the
    /// caller is about to reserve.
    ///
    /// `replacing` names an application whose running instance is about to be
    /// replaced by a redeploy; its memory is not counted against the request.
    pub async fn usage<C: ConnectionTrait>(
        &self,
        owner_id: &str,
        replacing: Option<&str>,
        conn: &C,
    ) -> Result<UsageSnapshot> {
        let credits = entity::users::Entity::find_by_id(owner_id.to_string())
            .one(conn)
            .await?
            .map(|user| user.credits)
            .unwrap_or(0);

        let live = entity::applications::Entity::find()
            .filter(entity::applications::Column::OwnerId.eq(owner_id))
            .filter(
                entity::applications::Column::Status
                    .is_in([ApplicationStatus::Pending, ApplicationStatus::Running]),
            )
            .all(conn)
            .await?;

        let used_mb = live
            .iter()
            .filter(|app| {
                !(app.status == ApplicationStatus::Running && Some(app.name.as_str()) == replacing)
            })
            .map(|app| app.memory_mb)
            .sum();

        let reserved_credits = live
            .iter()
            .filter(|app| app.status == ApplicationStatus::Pending)
            .map(|app| app.credit_deficit)
            .sum();

        Ok(UsageSnapshot {
            used_mb,
            credits,
            reserved_credits,
        })
    }

    /// Quote a request against current state without reserving anything
    #[instrument(skip(self))]
    pub async fn check(&self, owner_id: &str, requested_mb: i32) -> Result<AdmissionDecision> {
        let usage = self.usage(owner_id, None, &self.db).await?;
        let decision = self.evaluate(&usage, requested_mb)?;
        debug!(?usage, ?decision, "admission quote");
        Ok(decision)
    }

    #[instrument(skip(self))]
    pub async fn balance(&self, owner_id: &str) -> Result<BalanceInfo> {
        let usage = self.usage(owner_id, None, &self.db).await?;

        Ok(BalanceInfo {
            credits: usage.credits,
            reserved_credits: usage.reserved_credits,
            used_mb: usage.used_mb,
            free_allowance_mb: self.free_allowance_mb,
            free_available_mb: (self.free_allowance_mb - usage.used_mb).max(0),
        })
    }
}
