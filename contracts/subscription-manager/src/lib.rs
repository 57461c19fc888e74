//! TierPay Subscription Manager Contract
//!
//! Manages a versioned catalog of prepaid subscription plans and one
//! subscription record per account, paid in a single SEP-41 token held in
//! contract custody. The owner delegates day-to-day control through two
//! roles: admins curate the catalog and the pause switch, treasurers
//! withdraw collected revenue. Any caller may sweep expired auto-renew
//! accounts in batches; each account in a batch succeeds or is skipped
//! independently.
//!
//! ## Storage Strategy
//! - `instance()`: owner, token address, pause flag, plan id counter,
//!   operation lock, and per-(account, role) membership markers. Small,
//!   fixed config shared across all entries in one ledger entry with a
//!   single TTL.
//! - `persistent()`: one `Plan` per plan_id and one `Subscription` per
//!   account. Each is a separate ledger entry with its own TTL, bumped on
//!   every write.
//!
//! ## State Machine
//! An account's subscription record transitions as follows:
//!
//!   (none)  --purchase/start_trial--> Active(expiry_time)
//!   Active  --purchase-->             Active(expiry stacked by duration)
//!   Active  --change_plan-->          Active(now + new plan duration)
//!   Active  --time passes-->          Expired (reads reflect ledger clock)
//!   Active  --cancel/refund-->        (none)
//!   Expired --renewal sweep-->        Active(now + duration)  [auto_renew only]
//!
//! Expiry is lazy: no storage write happens at the moment a subscription
//! lapses. `status_of` folds the ledger timestamp into the answer.
//!
//! ## Invariants
//! - One record per account; purchases stack expiry, plan changes restart it.
//! - A record snapshots the plan version in force when it was written.
//!   Catalog edits bump the plan's version and never touch existing records.
//! - Every inbound payment is an allowance pull verified against the
//!   contract's own balance delta, so a token that misreports success
//!   cannot create an unpaid subscription.
//! - Fund-moving entrypoints hold a storage lock for their full duration.
//! - Timestamp and amount arithmetic uses checked operations.
#![no_std]
#![allow(unexpected_cfgs)]

use soroban_sdk::{
    contract, contracterror, contractevent, contractimpl, contracttype, token::TokenClient,
    Address, Env, String, Vec,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Persistent storage TTL in ledgers (~30 days at 5 s/ledger).
/// Bumped on every write so plan and subscription data never expire.
pub const PERSISTENT_BUMP_LEDGERS: u32 = 518_400;

/// Longest plan period accepted by the catalog, in seconds (365 days).
pub const MAX_PLAN_DURATION_SECS: u64 = 31_536_000;

/// Longest benefits description accepted by the catalog, in bytes.
pub const MAX_BENEFITS_LEN: u32 = 100;

/// How long after a subscription's `start_time` a refund is accepted,
/// in seconds (7 days). The boundary itself is inside the window.
pub const REFUND_WINDOW_SECS: u64 = 604_800;

// ---------------------------------------------------------------------------
// Error Types
// ---------------------------------------------------------------------------

#[contracterror]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Error {
    AlreadyInitialized = 1,
    NotInitialized = 2,
    Unauthorized = 3,
    Paused = 4,
    InvalidPlanTerms = 5,
    PlanNotFound = 6,
    InvalidPlan = 7,
    NoTrialAvailable = 8,
    AlreadySubscribed = 9,
    NoActiveSubscription = 10,
    RefundWindowExpired = 11,
    NoPaymentToRefund = 12,
    TransferFailed = 13,
    InvalidRecipient = 14,
    InvalidAmount = 15,
    InsufficientBalance = 16,
    ReentrantCall = 17,
    Overflow = 18,
}

// ---------------------------------------------------------------------------
// Storage Types
// ---------------------------------------------------------------------------

/// Delegated capability. The owner grants and revokes these; `Admin` curates
/// the plan catalog and the pause switch, `Treasury` withdraws custody funds.
#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Admin = 0,
    Treasury = 1,
}

/// Discriminants for all storage keys.
///
/// Instance keys: contract config, one ledger entry. Persistent keys
/// (Plan, Subscription): per-plan definitions and per-account subscription
/// records, each with their own TTL.
#[contracttype]
pub enum DataKey {
    // --- instance() ---
    Owner,
    Token,
    Paused,
    /// Id handed to the next `add_plan`; starts at 1.
    NextPlanId,
    /// Present while a fund-moving entrypoint is executing.
    OpLock,
    /// Membership marker, present when the account holds the role.
    Role(Address, Role),
    // --- persistent() ---
    /// Plan keyed by plan_id (u32).
    Plan(u32),
    /// Subscription record keyed by account Address.
    Subscription(Address),
}

/// A catalog entry. Plans are never deleted; `deactivate_plan` clears
/// `active` and `update_plan` bumps `version` in place.
///
/// `price` is the token amount charged per period. A zero-price plan is
/// trial-only and cannot be purchased. `duration` and `trial_duration` are
/// in seconds; `trial_duration == 0` means the plan offers no trial.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Plan {
    /// Token amount charged when purchasing, switching, or renewing.
    pub price: i128,
    /// Length of one paid period in seconds.
    pub duration: u64,
    /// Length of the free trial in seconds, 0 if none. At most `duration`.
    pub trial_duration: u64,
    /// Short human-readable benefits description.
    pub benefits: String,
    /// Whether the plan accepts new purchases, trials, and renewals.
    pub active: bool,
    /// Incremented by every `update_plan`. Records snapshot this.
    pub version: u32,
}

/// Per-account subscription record.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subscription {
    /// Whether a subscription record is in force. Stays `true` after the
    /// expiry passes; only cancel and refund clear it.
    pub active: bool,
    /// The plan this subscription is for.
    pub plan_id: u32,
    /// The plan's version at the time this record was last paid for.
    pub plan_version: u32,
    /// Unix timestamp (seconds) of the most recent purchase, switch,
    /// trial start, or renewal. Anchors the refund window.
    pub start_time: u64,
    /// Unix timestamp (seconds) at which the paid period ends.
    pub expiry_time: u64,
    /// Whether the renewal sweep may charge this account after expiry.
    pub auto_renew: bool,
}

impl Subscription {
    /// The record value for an account with no subscription. Reading a
    /// missing record and reading an explicitly cleared one are
    /// indistinguishable.
    pub fn none() -> Self {
        Subscription {
            active: false,
            plan_id: 0,
            plan_version: 0,
            start_time: 0,
            expiry_time: 0,
            auto_renew: false,
        }
    }
}

/// Public view of an account's subscription, with expiry folded in.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EffectiveStatus {
    /// `true` only while a record exists and its expiry is in the future.
    pub active: bool,
    /// The plan_id if a record exists, or 0 if none.
    pub plan_id: u32,
    /// The snapshotted plan version, or 0 if none.
    pub plan_version: u32,
    /// Expiry timestamp in seconds. 0 if no record.
    pub expiry_time: u64,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[contractevent]
pub struct ContractInitialized {
    #[topic]
    pub owner: Address,
    pub token: Address,
}

#[contractevent]
pub struct PlanAdded {
    #[topic]
    pub plan_id: u32,
    pub price: i128,
    pub duration: u64,
    pub trial_duration: u64,
    pub benefits: String,
    pub version: u32,
}

#[contractevent]
pub struct PlanUpdated {
    #[topic]
    pub plan_id: u32,
    pub price: i128,
    pub duration: u64,
    pub trial_duration: u64,
    pub benefits: String,
    pub version: u32,
}

#[contractevent]
pub struct PlanDeactivated {
    #[topic]
    pub plan_id: u32,
}

/// Emitted for paid purchases and for free trial starts; a trial carries
/// `amount_paid == 0`.
#[contractevent]
pub struct SubscriptionPurchased {
    #[topic]
    pub account: Address,
    #[topic]
    pub plan_id: u32,
    pub plan_version: u32,
    pub amount_paid: i128,
    pub expiry_time: u64,
}

#[contractevent]
pub struct PlanSwitched {
    #[topic]
    pub account: Address,
    #[topic]
    pub plan_id: u32,
    pub plan_version: u32,
    pub amount_paid: i128,
    pub expiry_time: u64,
}

#[contractevent]
pub struct SubscriptionRenewed {
    #[topic]
    pub account: Address,
    #[topic]
    pub plan_id: u32,
    pub plan_version: u32,
    pub amount_paid: i128,
    pub expiry_time: u64,
}

#[contractevent]
pub struct SubscriptionCancelled {
    #[topic]
    pub account: Address,
}

#[contractevent]
pub struct SubscriptionRefunded {
    #[topic]
    pub account: Address,
    pub amount: i128,
}

#[contractevent]
pub struct AutoRenewToggled {
    #[topic]
    pub account: Address,
    pub enabled: bool,
}

#[contractevent]
pub struct TreasuryWithdrawn {
    #[topic]
    pub recipient: Address,
    pub amount: i128,
}

#[contractevent]
pub struct RoleGranted {
    #[topic]
    pub account: Address,
    pub role: Role,
}

#[contractevent]
pub struct RoleRevoked {
    #[topic]
    pub account: Address,
    pub role: Role,
}

#[contractevent]
pub struct PauseToggled {
    pub paused: bool,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[contract]
pub struct SubscriptionManager;

#[contractimpl]
impl SubscriptionManager {
    // -----------------------------------------------------------------------
    // init
    // -----------------------------------------------------------------------

    /// Initialize the contract. May only be called once.
    ///
    /// `owner` is the only address that can grant and revoke roles, and
    /// starts holding both `Admin` and `Treasury`. `token` is the SEP-41
    /// asset all payments, refunds, and withdrawals use; it is fixed for
    /// the life of the contract.
    pub fn init(env: Env, owner: Address, token: Address) -> Result<(), Error> {
        if env.storage().instance().has(&DataKey::Owner) {
            return Err(Error::AlreadyInitialized);
        }

        owner.require_auth();

        env.storage().instance().set(&DataKey::Owner, &owner);
        env.storage().instance().set(&DataKey::Token, &token);
        env.storage().instance().set(&DataKey::Paused, &false);
        env.storage().instance().set(&DataKey::NextPlanId, &1u32);
        env.storage()
            .instance()
            .set(&DataKey::Role(owner.clone(), Role::Admin), &true);
        env.storage()
            .instance()
            .set(&DataKey::Role(owner.clone(), Role::Treasury), &true);

        ContractInitialized { owner, token }.publish(&env);

        Ok(())
    }

    // -----------------------------------------------------------------------
    // roles
    // -----------------------------------------------------------------------

    /// Grant `role` to `account`. Owner only. Granting an already-held
    /// role is a no-op that still emits the event.
    pub fn grant_role(env: Env, caller: Address, account: Address, role: Role) -> Result<(), Error> {
        require_initialized(&env)?;
        require_owner(&env, &caller)?;

        env.storage()
            .instance()
            .set(&DataKey::Role(account.clone(), role), &true);

        RoleGranted { account, role }.publish(&env);

        Ok(())
    }

    /// Revoke `role` from `account`. Owner only. The owner may revoke its
    /// own roles; ownership itself is not a role and cannot be revoked.
    pub fn revoke_role(
        env: Env,
        caller: Address,
        account: Address,
        role: Role,
    ) -> Result<(), Error> {
        require_initialized(&env)?;
        require_owner(&env, &caller)?;

        env.storage()
            .instance()
            .remove(&DataKey::Role(account.clone(), role));

        RoleRevoked { account, role }.publish(&env);

        Ok(())
    }

    /// Whether `account` currently holds `role`.
    pub fn has_role(env: Env, account: Address, role: Role) -> bool {
        env.storage().instance().has(&DataKey::Role(account, role))
    }

    // -----------------------------------------------------------------------
    // pause
    // -----------------------------------------------------------------------

    /// Set the pause flag. Admin only.
    ///
    /// While paused, purchase, start_trial, change_plan, process_renewals,
    /// and withdraw are rejected. Cancel and refund stay available so
    /// accounts can always exit.
    pub fn set_paused(env: Env, caller: Address, paused: bool) -> Result<(), Error> {
        require_initialized(&env)?;
        require_role(&env, &caller, Role::Admin)?;

        env.storage().instance().set(&DataKey::Paused, &paused);

        PauseToggled { paused }.publish(&env);

        Ok(())
    }

    pub fn is_paused(env: Env) -> bool {
        env.storage().instance().get(&DataKey::Paused).unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // plan catalog
    // -----------------------------------------------------------------------

    /// Add a plan to the catalog and return its id. Admin only.
    ///
    /// Ids are assigned sequentially starting at 1. The plan starts active
    /// at version 1. Terms are validated: `price` must not be negative,
    /// `duration` must be in (0, `MAX_PLAN_DURATION_SECS`], `trial_duration`
    /// must not exceed `duration`, `benefits` must fit `MAX_BENEFITS_LEN`
    /// bytes, and a plan with zero price must offer a trial.
    pub fn add_plan(
        env: Env,
        caller: Address,
        price: i128,
        duration: u64,
        trial_duration: u64,
        benefits: String,
    ) -> Result<u32, Error> {
        require_initialized(&env)?;
        require_role(&env, &caller, Role::Admin)?;
        validate_plan_terms(price, duration, trial_duration, &benefits)?;

        let plan_id: u32 = env
            .storage()
            .instance()
            .get(&DataKey::NextPlanId)
            .unwrap_or(1);
        let next = plan_id.checked_add(1).ok_or(Error::Overflow)?;
        env.storage().instance().set(&DataKey::NextPlanId, &next);

        let plan = Plan {
            price,
            duration,
            trial_duration,
            benefits: benefits.clone(),
            active: true,
            version: 1,
        };
        write_plan(&env, plan_id, &plan);

        PlanAdded {
            plan_id,
            price,
            duration,
            trial_duration,
            benefits,
            version: 1,
        }
        .publish(&env);

        Ok(plan_id)
    }

    /// Replace an active plan's terms and bump its version. Admin only.
    ///
    /// Existing subscription records keep the version they paid for; only
    /// future purchases, switches, and renewals see the new terms.
    /// Deactivated plans cannot be updated.
    pub fn update_plan(
        env: Env,
        caller: Address,
        plan_id: u32,
        price: i128,
        duration: u64,
        trial_duration: u64,
        benefits: String,
    ) -> Result<(), Error> {
        require_initialized(&env)?;
        require_role(&env, &caller, Role::Admin)?;

        let mut plan = require_plan_exists(&env, plan_id)?;
        if !plan.active {
            return Err(Error::PlanNotFound);
        }
        validate_plan_terms(price, duration, trial_duration, &benefits)?;

        plan.price = price;
        plan.duration = duration;
        plan.trial_duration = trial_duration;
        plan.benefits = benefits.clone();
        plan.version = plan.version.checked_add(1).ok_or(Error::Overflow)?;
        let version = plan.version;
        write_plan(&env, plan_id, &plan);

        PlanUpdated {
            plan_id,
            price,
            duration,
            trial_duration,
            benefits,
            version,
        }
        .publish(&env);

        Ok(())
    }

    /// Retire a plan from sale. Admin only.
    ///
    /// Existing subscriptions keep running until their expiry, but the plan
    /// no longer accepts purchases, trials, switches, or renewals.
    /// Deactivation is permanent and the id is never reused.
    pub fn deactivate_plan(env: Env, caller: Address, plan_id: u32) -> Result<(), Error> {
        require_initialized(&env)?;
        require_role(&env, &caller, Role::Admin)?;

        let mut plan = require_plan_exists(&env, plan_id)?;
        if !plan.active {
            return Err(Error::PlanNotFound);
        }

        plan.active = false;
        write_plan(&env, plan_id, &plan);

        PlanDeactivated { plan_id }.publish(&env);

        Ok(())
    }

    /// Fetch a plan by id, active or not.
    pub fn get_plan(env: Env, plan_id: u32) -> Result<Plan, Error> {
        require_plan_exists(&env, plan_id)
    }

    /// How many plans have ever been added, including deactivated ones.
    pub fn plan_count(env: Env) -> u32 {
        let next: u32 = env
            .storage()
            .instance()
            .get(&DataKey::NextPlanId)
            .unwrap_or(1);
        next.saturating_sub(1)
    }

    // -----------------------------------------------------------------------
    // purchase
    // -----------------------------------------------------------------------

    /// Purchase a period of `plan_id` for `account`, pulling the plan price
    /// from the account's token allowance.
    ///
    /// If the account already has an unexpired subscription the new period
    /// stacks on top of the current expiry, even across plans; otherwise the
    /// period starts now. The record snapshots the plan's current version.
    /// Missing, deactivated, and zero-price plans are rejected as
    /// `InvalidPlan`.
    pub fn purchase(env: Env, account: Address, plan_id: u32) -> Result<(), Error> {
        require_initialized(&env)?;
        account.require_auth();
        require_not_paused(&env)?;
        acquire_op_lock(&env)?;

        let plan = require_purchasable_plan(&env, plan_id)?;

        pull_exact(&env, &account, plan.price)?;

        let now = env.ledger().timestamp();
        let sub = load_subscription(&env, &account);
        let expiry_time = next_expiry(&sub, now, plan.duration)?;

        let record = Subscription {
            active: true,
            plan_id,
            plan_version: plan.version,
            start_time: now,
            expiry_time,
            auto_renew: sub.auto_renew,
        };
        write_subscription(&env, &account, &record);

        release_op_lock(&env);

        SubscriptionPurchased {
            account,
            plan_id,
            plan_version: plan.version,
            amount_paid: plan.price,
            expiry_time,
        }
        .publish(&env);

        Ok(())
    }

    // -----------------------------------------------------------------------
    // start_trial
    // -----------------------------------------------------------------------

    /// Start a free trial of `plan_id` for `account`. No tokens move.
    ///
    /// The plan must be active and offer a trial, else `NoTrialAvailable`.
    /// Rejected with `AlreadySubscribed` while any record is in force, even
    /// one whose expiry has passed; cancelling clears the record and makes
    /// the account eligible again.
    pub fn start_trial(env: Env, account: Address, plan_id: u32) -> Result<(), Error> {
        require_initialized(&env)?;
        account.require_auth();
        require_not_paused(&env)?;

        let plan: Plan = env
            .storage()
            .persistent()
            .get(&DataKey::Plan(plan_id))
            .ok_or(Error::NoTrialAvailable)?;
        if !plan.active || plan.trial_duration == 0 {
            return Err(Error::NoTrialAvailable);
        }

        let sub = load_subscription(&env, &account);
        if sub.active {
            return Err(Error::AlreadySubscribed);
        }

        let now = env.ledger().timestamp();
        let expiry_time = now.checked_add(plan.trial_duration).ok_or(Error::Overflow)?;

        let record = Subscription {
            active: true,
            plan_id,
            plan_version: plan.version,
            start_time: now,
            expiry_time,
            auto_renew: sub.auto_renew,
        };
        write_subscription(&env, &account, &record);

        SubscriptionPurchased {
            account,
            plan_id,
            plan_version: plan.version,
            amount_paid: 0,
            expiry_time,
        }
        .publish(&env);

        Ok(())
    }

    // -----------------------------------------------------------------------
    // change_plan
    // -----------------------------------------------------------------------

    /// Switch `account`'s unexpired subscription to `new_plan_id`, charging
    /// the new plan's full price.
    ///
    /// Switching always restarts the clock at `now + new duration`; unused
    /// time on the old plan is forfeited, whether the switch is an upgrade
    /// or a downgrade. Switching to the same plan is allowed and behaves
    /// the same way. Requires an unexpired subscription.
    pub fn change_plan(env: Env, account: Address, new_plan_id: u32) -> Result<(), Error> {
        require_initialized(&env)?;
        account.require_auth();
        require_not_paused(&env)?;
        acquire_op_lock(&env)?;

        let now = env.ledger().timestamp();
        let sub = load_subscription(&env, &account);
        if !sub.active || sub.expiry_time <= now {
            return Err(Error::NoActiveSubscription);
        }

        let plan = require_purchasable_plan(&env, new_plan_id)?;

        pull_exact(&env, &account, plan.price)?;

        let expiry_time = now.checked_add(plan.duration).ok_or(Error::Overflow)?;

        let record = Subscription {
            active: true,
            plan_id: new_plan_id,
            plan_version: plan.version,
            start_time: now,
            expiry_time,
            auto_renew: sub.auto_renew,
        };
        write_subscription(&env, &account, &record);

        release_op_lock(&env);

        PlanSwitched {
            account,
            plan_id: new_plan_id,
            plan_version: plan.version,
            amount_paid: plan.price,
            expiry_time,
        }
        .publish(&env);

        Ok(())
    }

    // -----------------------------------------------------------------------
    // cancel
    // -----------------------------------------------------------------------

    /// Cancel `account`'s subscription immediately, clearing the record.
    ///
    /// No refund is issued and no tokens move; use `refund` inside the
    /// refund window instead. Works while paused. Cancelling an expired but
    /// uncleared record is allowed and clears it.
    pub fn cancel(env: Env, account: Address) -> Result<(), Error> {
        require_initialized(&env)?;
        account.require_auth();

        let sub = load_subscription(&env, &account);
        if !sub.active {
            return Err(Error::NoActiveSubscription);
        }

        clear_subscription(&env, &account);

        SubscriptionCancelled { account }.publish(&env);

        Ok(())
    }

    // -----------------------------------------------------------------------
    // refund
    // -----------------------------------------------------------------------

    /// Refund `account`'s subscription and clear the record.
    ///
    /// Only accepted within `REFUND_WINDOW_SECS` of the record's
    /// `start_time` (the boundary is inside the window). The amount pushed
    /// back is the plan's current catalog price. Free trials have nothing
    /// to refund. Works while paused.
    pub fn refund(env: Env, account: Address) -> Result<(), Error> {
        require_initialized(&env)?;
        account.require_auth();
        acquire_op_lock(&env)?;

        let sub = load_subscription(&env, &account);
        if !sub.active {
            return Err(Error::NoActiveSubscription);
        }

        let now = env.ledger().timestamp();
        if now.saturating_sub(sub.start_time) > REFUND_WINDOW_SECS {
            return Err(Error::RefundWindowExpired);
        }

        let plan = require_plan_exists(&env, sub.plan_id)?;
        if plan.price <= 0 {
            return Err(Error::NoPaymentToRefund);
        }

        // Clear the record before pushing funds out; a reentrant refund
        // then finds no record. A failed push rolls the clear back.
        clear_subscription(&env, &account);
        push_tokens(&env, &account, plan.price)?;

        release_op_lock(&env);

        SubscriptionRefunded {
            account,
            amount: plan.price,
        }
        .publish(&env);

        Ok(())
    }

    // -----------------------------------------------------------------------
    // auto-renew
    // -----------------------------------------------------------------------

    /// Flip `account`'s auto-renew flag and return the new value.
    ///
    /// Allowed with or without a subscription record; toggling with none
    /// materializes an otherwise-empty record carrying the flag, which a
    /// later purchase or trial picks up.
    pub fn toggle_auto_renew(env: Env, account: Address) -> Result<bool, Error> {
        require_initialized(&env)?;
        account.require_auth();

        let mut sub = load_subscription(&env, &account);
        sub.auto_renew = !sub.auto_renew;
        write_subscription(&env, &account, &sub);

        AutoRenewToggled {
            account,
            enabled: sub.auto_renew,
        }
        .publish(&env);

        Ok(sub.auto_renew)
    }

    // -----------------------------------------------------------------------
    // reads
    // -----------------------------------------------------------------------

    /// The stored subscription record for `account`, exactly as written.
    /// Accounts with no record read as `Subscription::none()`.
    pub fn get_subscription(env: Env, account: Address) -> Subscription {
        load_subscription(&env, &account)
    }

    /// The effective subscription status for `account`, with the ledger
    /// timestamp folded in: `active` is `true` only while the record's
    /// expiry is in the future.
    pub fn status_of(env: Env, account: Address) -> EffectiveStatus {
        let sub = load_subscription(&env, &account);
        let now = env.ledger().timestamp();
        EffectiveStatus {
            active: sub.active && sub.expiry_time > now,
            plan_id: sub.plan_id,
            plan_version: sub.plan_version,
            expiry_time: sub.expiry_time,
        }
    }

    // -----------------------------------------------------------------------
    // process_renewals
    // -----------------------------------------------------------------------

    /// Charge and extend every eligible account in `accounts`, returning
    /// how many renewed. Callable by anyone; the accounts themselves do not
    /// sign.
    ///
    /// An account is eligible when its record is active with `auto_renew`
    /// set, its expiry has passed, and its plan is still active. Each
    /// eligible account is charged the plan's current price through the
    /// allowance pull; the record then restarts at `now + duration` on the
    /// plan's current version, exactly as a purchase would write it.
    ///
    /// Ineligible accounts and accounts whose pull fails are skipped, never
    /// the whole batch, so a sweep can be resubmitted freely: an account
    /// renewed once is no longer eligible and a repeated sweep charges
    /// nobody twice. The one exception is a token that claims success while
    /// delivering less than the price; that aborts the whole sweep with
    /// `TransferFailed` so the token's transfers do not survive.
    pub fn process_renewals(env: Env, accounts: Vec<Address>) -> Result<u32, Error> {
        require_initialized(&env)?;
        require_not_paused(&env)?;
        acquire_op_lock(&env)?;

        let now = env.ledger().timestamp();
        let mut renewed: u32 = 0;
        for account in accounts.iter() {
            if try_renew_account(&env, &account, now)? {
                renewed += 1;
            }
        }

        release_op_lock(&env);

        Ok(renewed)
    }

    // -----------------------------------------------------------------------
    // withdraw
    // -----------------------------------------------------------------------

    /// Send `amount` of custody funds to `recipient`. Treasury role only.
    ///
    /// `amount` must be positive and no larger than the custody balance,
    /// and `recipient` must not be the contract itself. Custody funds are
    /// not segregated per account; refunds draw from the same pool, so
    /// treasury policy decides how much to leave behind.
    pub fn withdraw(
        env: Env,
        caller: Address,
        recipient: Address,
        amount: i128,
    ) -> Result<(), Error> {
        require_initialized(&env)?;
        require_role(&env, &caller, Role::Treasury)?;
        require_not_paused(&env)?;

        if amount <= 0 {
            return Err(Error::InvalidAmount);
        }
        let custody = env.current_contract_address();
        if recipient == custody {
            return Err(Error::InvalidRecipient);
        }

        acquire_op_lock(&env)?;

        let token = TokenClient::new(&env, &get_token(&env)?);
        if token.balance(&custody) < amount {
            return Err(Error::InsufficientBalance);
        }
        push_tokens(&env, &recipient, amount)?;

        release_op_lock(&env);

        TreasuryWithdrawn { recipient, amount }.publish(&env);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn require_initialized(env: &Env) -> Result<(), Error> {
    if !env.storage().instance().has(&DataKey::Owner) {
        return Err(Error::NotInitialized);
    }
    Ok(())
}

/// Verify that `caller` is the stored owner and has signed the invocation.
fn require_owner(env: &Env, caller: &Address) -> Result<(), Error> {
    let owner: Address = env
        .storage()
        .instance()
        .get(&DataKey::Owner)
        .ok_or(Error::NotInitialized)?;
    caller.require_auth();
    if caller != &owner {
        return Err(Error::Unauthorized);
    }
    Ok(())
}

/// Verify that `caller` holds `role` and has signed the invocation.
fn require_role(env: &Env, caller: &Address, role: Role) -> Result<(), Error> {
    caller.require_auth();
    if !env
        .storage()
        .instance()
        .has(&DataKey::Role(caller.clone(), role))
    {
        return Err(Error::Unauthorized);
    }
    Ok(())
}

fn require_not_paused(env: &Env) -> Result<(), Error> {
    let paused: bool = env.storage().instance().get(&DataKey::Paused).unwrap_or(false);
    if paused {
        return Err(Error::Paused);
    }
    Ok(())
}

/// Take the operation lock held for the duration of a fund-moving
/// entrypoint. An invocation that fails after taking the lock rolls it
/// back along with the rest of its writes.
fn acquire_op_lock(env: &Env) -> Result<(), Error> {
    if env.storage().instance().has(&DataKey::OpLock) {
        return Err(Error::ReentrantCall);
    }
    env.storage().instance().set(&DataKey::OpLock, &true);
    Ok(())
}

fn release_op_lock(env: &Env) {
    env.storage().instance().remove(&DataKey::OpLock);
}

fn get_token(env: &Env) -> Result<Address, Error> {
    env.storage()
        .instance()
        .get(&DataKey::Token)
        .ok_or(Error::NotInitialized)
}

/// Fetch the plan definition or return `PlanNotFound`. Returns inactive
/// plans as stored; admin and read paths want those too.
fn require_plan_exists(env: &Env, plan_id: u32) -> Result<Plan, Error> {
    env.storage()
        .persistent()
        .get(&DataKey::Plan(plan_id))
        .ok_or(Error::PlanNotFound)
}

/// Fetch a plan for a paid user action. Missing, deactivated, and
/// zero-price (trial-only) plans are all rejected as `InvalidPlan`.
fn require_purchasable_plan(env: &Env, plan_id: u32) -> Result<Plan, Error> {
    let plan: Plan = env
        .storage()
        .persistent()
        .get(&DataKey::Plan(plan_id))
        .ok_or(Error::InvalidPlan)?;
    if !plan.active || plan.price <= 0 {
        return Err(Error::InvalidPlan);
    }
    Ok(plan)
}

fn load_subscription(env: &Env, account: &Address) -> Subscription {
    env.storage()
        .persistent()
        .get(&DataKey::Subscription(account.clone()))
        .unwrap_or_else(Subscription::none)
}

fn write_subscription(env: &Env, account: &Address, record: &Subscription) {
    let key = DataKey::Subscription(account.clone());
    env.storage().persistent().set(&key, record);
    env.storage()
        .persistent()
        .extend_ttl(&key, PERSISTENT_BUMP_LEDGERS, PERSISTENT_BUMP_LEDGERS);
}

fn clear_subscription(env: &Env, account: &Address) {
    env.storage()
        .persistent()
        .remove(&DataKey::Subscription(account.clone()));
}

fn write_plan(env: &Env, plan_id: u32, plan: &Plan) {
    let key = DataKey::Plan(plan_id);
    env.storage().persistent().set(&key, plan);
    env.storage()
        .persistent()
        .extend_ttl(&key, PERSISTENT_BUMP_LEDGERS, PERSISTENT_BUMP_LEDGERS);
}

/// Validate catalog terms shared by `add_plan` and `update_plan`.
fn validate_plan_terms(
    price: i128,
    duration: u64,
    trial_duration: u64,
    benefits: &String,
) -> Result<(), Error> {
    if price < 0 {
        return Err(Error::InvalidPlanTerms);
    }
    if duration == 0 || duration > MAX_PLAN_DURATION_SECS {
        return Err(Error::InvalidPlanTerms);
    }
    if trial_duration > duration {
        return Err(Error::InvalidPlanTerms);
    }
    if benefits.len() > MAX_BENEFITS_LEN {
        return Err(Error::InvalidPlanTerms);
    }
    // A zero-price plan with no trial would be unusable.
    if price == 0 && trial_duration == 0 {
        return Err(Error::InvalidPlanTerms);
    }
    Ok(())
}

/// Extend from the current expiry if still unexpired, otherwise from now.
fn next_expiry(sub: &Subscription, now: u64, duration: u64) -> Result<u64, Error> {
    let base = if sub.active && sub.expiry_time > now {
        sub.expiry_time
    } else {
        now
    };
    base.checked_add(duration).ok_or(Error::Overflow)
}

/// Pull `amount` tokens from `from` into contract custody through the
/// token's allowance mechanism, then verify custody actually grew by at
/// least `amount`. A token that reports success while delivering less
/// (fee-on-transfer style) is rejected, and its sub-invocation rolls back.
fn pull_exact(env: &Env, from: &Address, amount: i128) -> Result<(), Error> {
    let token = TokenClient::new(env, &get_token(env)?);
    let custody = env.current_contract_address();

    let before = token.balance(&custody);
    if token
        .try_transfer_from(&custody, from, &custody, &amount)
        .is_err()
    {
        return Err(Error::TransferFailed);
    }
    let after = token.balance(&custody);

    let received = after.checked_sub(before).ok_or(Error::Overflow)?;
    if received < amount {
        return Err(Error::TransferFailed);
    }
    Ok(())
}

/// Send `amount` tokens from custody to `to`. Token-level failures surface
/// as `TransferFailed` instead of trapping the whole invocation.
fn push_tokens(env: &Env, to: &Address, amount: i128) -> Result<(), Error> {
    let token = TokenClient::new(env, &get_token(env)?);
    if token
        .try_transfer(&env.current_contract_address(), to, &amount)
        .is_err()
    {
        return Err(Error::TransferFailed);
    }
    Ok(())
}

/// Renew a single account inside a sweep. Returns `Ok(false)` to skip the
/// account: ineligible, or its pull failed and rolled itself back.
/// Returns `Err` only when the token claimed success while delivering
/// short; the sweep then aborts so the token's writes roll back too.
fn try_renew_account(env: &Env, account: &Address, now: u64) -> Result<bool, Error> {
    let sub = load_subscription(env, account);
    if !sub.active || !sub.auto_renew || now < sub.expiry_time {
        return Ok(false);
    }

    let plan: Plan = match env.storage().persistent().get(&DataKey::Plan(sub.plan_id)) {
        Some(p) => p,
        None => return Ok(false),
    };
    if !plan.active {
        return Ok(false);
    }

    // A zero-price plan renews without touching the token.
    if plan.price > 0 {
        let token = TokenClient::new(env, &get_token(env)?);
        let custody = env.current_contract_address();

        let before = token.balance(&custody);
        if token
            .try_transfer_from(&custody, account, &custody, &plan.price)
            .is_err()
        {
            // The account cannot fund the pull; the token frame already
            // rolled back, so skipping leaves no trace of the attempt.
            return Ok(false);
        }
        let after = token.balance(&custody);

        let received = after.checked_sub(before).ok_or(Error::Overflow)?;
        if received < plan.price {
            return Err(Error::TransferFailed);
        }
    }

    let expiry_time = now.checked_add(plan.duration).ok_or(Error::Overflow)?;

    let record = Subscription {
        active: true,
        plan_id: sub.plan_id,
        plan_version: plan.version,
        start_time: now,
        expiry_time,
        auto_renew: true,
    };
    write_subscription(env, account, &record);

    SubscriptionRenewed {
        account: account.clone(),
        plan_id: sub.plan_id,
        plan_version: plan.version,
        amount_paid: plan.price,
        expiry_time,
    }
    .publish(env);

    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
