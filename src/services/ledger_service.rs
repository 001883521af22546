use crate::{
    config::LedgerConfig,
    error::{ApiError, LedgerError, Result},
    utils::KeyedLocks,
};
use anyhow::anyhow;
use entity::sea_orm_active_enums::OrderStatus;
use sea_orm::{
    entity::*, query::*, sea_query::Expr, sea_query::OnConflict, ConnectionTrait,
    DatabaseConnection, DatabaseTransaction, TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Sole writer of credit balances: order approval adds, deploy debits subtract.
pub struct LedgerService {
    db: DatabaseConnection,
    user_locks: Arc<KeyedLocks>,
    admin_identity: String,
    credits_per_unit: i32,
}

impl LedgerService {
    pub fn new(db: DatabaseConnection, user_locks: Arc<KeyedLocks>, config: &LedgerConfig) -> Self {
        Self {
            db,
            user_locks,
            admin_identity: config.admin_identity.clone(),
            credits_per_unit: config.credits_per_unit,
        }
    }

    pub fn is_admin(&self, identity: &str) -> bool {
        identity == self.admin_identity
    }

    /// Users come into existence on first contact with zero credits
    #[instrument(skip(self))]
    pub async fn get_or_create_user(&self, owner_id: &str) -> Result<entity::users::Model> {
        get_or_create_user_in(owner_id, &self.db).await
    }

    #[instrument(skip(self))]
    pub async fn create_order(&self, owner_id: &str, amount: i32) -> Result<entity::orders::Model> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount).into());
        }
        let credits_requested = amount
            .checked_mul(self.credits_per_unit)
            .ok_or(LedgerError::InvalidAmount(amount))?;

        let txn = self.db.begin().await?;
        get_or_create_user_in(owner_id, &txn).await?;

        let now = time::OffsetDateTime::now_utc();
        let order = entity::orders::ActiveModel {
            id: Set(Uuid::now_v7()),
            order_id: Set(generate_order_id(now)),
            owner_id: Set(owner_id.to_string()),
            amount: Set(amount),
            credits_requested: Set(credits_requested),
            status: Set(OrderStatus::Pending),
            approved_by: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        info!(
            "Created order {} for {}: amount={}, credits={}",
            order.order_id, owner_id, amount, credits_requested
        );

        Ok(order)
    }

    /// Flip a pending order to approved and credit its owner, exactly once.
    ///
    /// Returns the approved order and the owner's new balance.
    #[instrument(skip(self))]
    pub async fn approve(
        &self,
        order_id: &str,
        approver: &str,
    ) -> Result<(entity::orders::Model, i32)> {
        if !self.is_admin(approver) {
            warn!("Rejected approval of {} by {}", order_id, approver);
            return Err(LedgerError::Unauthorized(approver.to_string()).into());
        }

        let order = self.find_order(order_id, &self.db).await?;
        ensure_pending(&order)?;

        let _user = self.user_locks.lock(&order.owner_id).await;
        let txn = self.db.begin().await?;

        // Only one caller can win the pending -> approved transition
        let now = time::OffsetDateTime::now_utc();
        let flipped = entity::orders::Entity::update_many()
            .set(entity::orders::ActiveModel {
                status: Set(OrderStatus::Approved),
                approved_by: Set(Some(approver.to_string())),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(entity::orders::Column::OrderId.eq(order_id))
            .filter(entity::orders::Column::Status.eq(OrderStatus::Pending))
            .exec(&txn)
            .await?;

        if flipped.rows_affected != 1 {
            let current = self.find_order(order_id, &txn).await?;
            txn.rollback().await?;
            ensure_pending(&current)?;
            return Err(ApiError::Internal(anyhow!(
                "Order {} could not be approved",
                order_id
            )));
        }

        get_or_create_user_in(&order.owner_id, &txn).await?;
        entity::users::Entity::update_many()
            .col_expr(
                entity::users::Column::Credits,
                Expr::col(entity::users::Column::Credits).add(order.credits_requested),
            )
            .col_expr(entity::users::Column::UpdatedAt, Expr::value(now))
            .filter(entity::users::Column::Id.eq(order.owner_id.as_str()))
            .exec(&txn)
            .await?;

        let balance = get_or_create_user_in(&order.owner_id, &txn).await?.credits;
        let approved = self.find_order(order_id, &txn).await?;
        txn.commit().await?;

        info!(
            "Approved order {}: +{} credits for {}, balance={}",
            order_id, order.credits_requested, order.owner_id, balance
        );

        Ok((approved, balance))
    }

    /// Withdraw a pending order. Its owner or the administrator may cancel.
    #[instrument(skip(self))]
    pub async fn cancel(&self, order_id: &str, caller: &str) -> Result<entity::orders::Model> {
        let order = self.find_order(order_id, &self.db).await?;
        if order.owner_id != caller && !self.is_admin(caller) {
            return Err(LedgerError::Unauthorized(caller.to_string()).into());
        }
        ensure_pending(&order)?;

        let cancelled = entity::orders::Entity::update_many()
            .set(entity::orders::ActiveModel {
                status: Set(OrderStatus::Cancelled),
                updated_at: Set(time::OffsetDateTime::now_utc()),
                ..Default::default()
            })
            .filter(entity::orders::Column::OrderId.eq(order_id))
            .filter(entity::orders::Column::Status.eq(OrderStatus::Pending))
            .exec(&self.db)
            .await?;

        let current = self.find_order(order_id, &self.db).await?;
        if cancelled.rows_affected != 1 {
            ensure_pending(&current)?;
        }

        info!("Cancelled order {} by {}", order_id, caller);
        Ok(current)
    }

    pub async fn list_orders(&self, owner_id: &str) -> Result<Vec<entity::orders::Model>> {
        let orders = entity::orders::Entity::find()
            .filter(entity::orders::Column::OwnerId.eq(owner_id))
            .order_by_desc(entity::orders::Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(orders)
    }

    /// Consume `amount` credits inside the caller's transaction. The caller
    /// holds the user's section, and the amount was reserved at admission.
    #[instrument(skip(self, txn))]
    pub async fn debit_in_txn(
        &self,
        owner_id: &str,
        amount: i32,
        txn: &DatabaseTransaction,
    ) -> Result<i32> {
        if amount < 0 {
            return Err(ApiError::Internal(anyhow!("Negative debit {}", amount)));
        }
        if amount == 0 {
            return Ok(get_or_create_user_in(owner_id, txn).await?.credits);
        }

        let debited = entity::users::Entity::update_many()
            .col_expr(
                entity::users::Column::Credits,
                Expr::col(entity::users::Column::Credits).sub(amount),
            )
            .col_expr(
                entity::users::Column::UpdatedAt,
                Expr::value(time::OffsetDateTime::now_utc()),
            )
            .filter(entity::users::Column::Id.eq(owner_id))
            .filter(entity::users::Column::Credits.gte(amount))
            .exec(txn)
            .await?;

        // Credits never go negative; a reserved debit that no longer fits is a bug
        if debited.rows_affected != 1 {
            return Err(ApiError::Internal(anyhow!(
                "Cannot debit {} credits from {}",
                amount,
                owner_id
            )));
        }

        let balance = get_or_create_user_in(owner_id, txn).await?.credits;
        info!("Debited {} credits from {}, balance={}", amount, owner_id, balance);
        Ok(balance)
    }

    async fn find_order<C: ConnectionTrait>(
        &self,
        order_id: &str,
        conn: &C,
    ) -> Result<entity::orders::Model> {
        entity::orders::Entity::find()
            .filter(entity::orders::Column::OrderId.eq(order_id))
            .one(conn)
            .await?
            .ok_or_else(|| LedgerError::OrderNotFound(order_id.to_string()).into())
    }
}

/// Find the user, inserting a zero-credit row on first contact.
pub async fn get_or_create_user_in<C: ConnectionTrait>(
    owner_id: &str,
    conn: &C,
) -> Result<entity::users::Model> {
    if let Some(user) = entity::users::Entity::find_by_id(owner_id.to_string())
        .one(conn)
        .await?
    {
        return Ok(user);
    }

    let now = time::OffsetDateTime::now_utc();
    let user = entity::users::ActiveModel {
        id: Set(owner_id.to_string()),
        credits: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    };

    // A concurrent first contact may have inserted the row already
    entity::users::Entity::insert(user)
        .on_conflict(
            OnConflict::column(entity::users::Column::Id)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

    entity::users::Entity::find_by_id(owner_id.to_string())
        .one(conn)
        .await?
        .ok_or_else(|| ApiError::Internal(anyhow!("Failed to read user {} after insert", owner_id)))
}

fn ensure_pending(order: &entity::orders::Model) -> std::result::Result<(), LedgerError> {
    if order.status == OrderStatus::Pending {
        Ok(())
    } else {
        Err(LedgerError::NotPending {
            order_id: order.order_id.clone(),
            status: order.status.to_value(),
        })
    }
}

/// `ORD<unix seconds><6 upper-case hex>`
fn generate_order_id(now: time::OffsetDateTime) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "ORD{}{}",
        now.unix_timestamp(),
        random[..6].to_ascii_uppercase()
    )
}
