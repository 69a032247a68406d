//! # Stake Ledger Program
//!
//! A single-authority configuration record plus a per-depositor stake ledger.
//!
//! ## Instructions
//!
//! | Instruction | Signer | Effect |
//! |-------------|--------|--------|
//! | `initialize(mint)` | `OWNER` only | Creates the global state, `initialized = true` |
//! | `stake(amount)` | any staker | Adds `amount` to the staker's record, capped at `MAX_STAKE` |
//! | `unstake(amount)` | record owner | Subtracts `amount` from the staker's record |
//!
//! ## Accounts
//!
//! ```text
//! GlobalState  PDA ["global_state"]            one per program, written once
//! UserStake    PDA ["user_stake", staker]      one per staker, never closed
//! ```
//!
//! Every handler runs all of its checks before touching a single field, so a
//! rejected instruction leaves both accounts exactly as it found them. The
//! ledger transitions live on the account types (`GlobalState::initialize`,
//! `UserStake::deposit`, `UserStake::withdraw`) and the handlers only wire
//! accounts, logs and events around them.

#![allow(unexpected_cfgs)]

use anchor_lang::prelude::*;

declare_id!("4zRwFfdpJMVnS6GejDevW1ASbPBDjnfvXGWiQUNd5YVK");

// ============================================================================
// CONSTANTS
// ============================================================================

/// The only key allowed to run `initialize`.
#[constant]
pub const OWNER: Pubkey = pubkey!("J6pjqSZXcppQeYWK1D8fL5uTJgeksSA14nEAdYjuTQpj");

/// Maximum cumulative stake per staker: 1 SOL in lamports.
#[constant]
pub const MAX_STAKE: u64 = 1_000_000_000;

/// Anchor discriminator size (8 bytes)
pub const DISCRIMINATOR_SIZE: usize = 8;

/// Seed for the global state PDA
pub const GLOBAL_STATE_SEED: &[u8] = b"global_state";

/// Seed prefix for user stake PDAs
pub const USER_STAKE_SEED: &[u8] = b"user_stake";

// ============================================================================
// PROGRAM MODULE
// ============================================================================

#[program]
pub mod stake_ledger {
    use super::*;

    /// Create the global state. Only `OWNER` may call this, and only once.
    pub fn initialize(ctx: Context<Initialize>, mint: Pubkey) -> Result<()> {
        let signer = ctx.accounts.signer.key();
        let global_state = &mut ctx.accounts.global_state;

        global_state.initialize(signer, mint, ctx.bumps.global_state)?;

        msg!("Global state initialized: authority={}, mint={}", signer, mint);
        emit!(InitializeEvent {
            message: "Initialized global state".to_string(),
            signer,
            mint,
        });

        Ok(())
    }

    /// Deposit `amount` into the caller's stake record.
    ///
    /// The record is created on first use. The cap applies to the running
    /// total, so a deposit that crosses `MAX_STAKE` fails even if it is small.
    pub fn stake(ctx: Context<Stake>, amount: u64) -> Result<()> {
        require_initialized(&ctx.accounts.global_state)?;

        let staker = ctx.accounts.staker.key();
        let user_stake = &mut ctx.accounts.user_stake;

        msg!("Before stake - balance: {}, amount: {}", user_stake.amount, amount);

        let total_staked = user_stake.deposit(staker, amount, ctx.bumps.user_stake)?;

        msg!(
            "After stake - balance: {}, remaining capacity: {}",
            total_staked,
            user_stake.remaining_capacity()
        );
        emit!(StakeEvent { staker, amount, total_staked });

        Ok(())
    }

    /// Withdraw `amount` from the caller's stake record.
    ///
    /// Withdrawing the full balance leaves a zero-amount record behind.
    pub fn unstake(ctx: Context<Unstake>, amount: u64) -> Result<()> {
        require_initialized(&ctx.accounts.global_state)?;

        let staker = ctx.accounts.staker.key();
        let user_stake = &mut ctx.accounts.user_stake;

        msg!("Before unstake - balance: {}, amount: {}", user_stake.amount, amount);

        let total_staked = user_stake.withdraw(staker, amount)?;

        msg!("After unstake - balance: {}", total_staked);
        emit!(UnstakeEvent { staker, amount, total_staked });

        Ok(())
    }
}

/// Reject the instruction unless the global state exists and is initialized.
///
/// The global state is taken as an unchecked account so that a missing record
/// surfaces as `NotInitialized` rather than Anchor's generic
/// `AccountNotInitialized`.
fn require_initialized(global_state: &UncheckedAccount) -> Result<()> {
    let data = global_state.try_borrow_data()?;
    GlobalState::load(global_state.owner, &data)?;
    Ok(())
}

// ============================================================================
// ACCOUNT STRUCTURES
// ============================================================================

/// Program-wide configuration.
/// PDA seeds: ["global_state"]
#[account]
#[derive(InitSpace, Default)]
pub struct GlobalState {
    /// Set on the first successful `initialize`, never cleared
    pub initialized: bool,
    /// Mint the ledger is denominated against
    pub mint: Pubkey,
    /// Key that ran `initialize`
    pub authority: Pubkey,
    /// Canonical PDA bump
    pub bump: u8,
}

impl GlobalState {
    /// Apply `initialize` to this record.
    ///
    /// SECURITY: the authority check comes first so a non-owner always sees
    /// `NotOwner`, whether or not the state already exists.
    pub fn initialize(&mut self, signer: Pubkey, mint: Pubkey, bump: u8) -> Result<()> {
        require_keys_eq!(signer, OWNER, LedgerError::NotOwner);
        require!(!self.initialized, LedgerError::AlreadyInitialized);

        self.initialized = true;
        self.mint = mint;
        self.authority = signer;
        self.bump = bump;

        Ok(())
    }

    pub fn is_authority(&self, key: &Pubkey) -> bool {
        self.initialized && &self.authority == key
    }

    /// Decode the global state from a raw account and require it to be live.
    ///
    /// An account that is empty, owned by another program, or holds a record
    /// with `initialized = false` all count as "not initialized".
    pub fn load(owner: &Pubkey, data: &[u8]) -> Result<GlobalState> {
        if owner != &crate::ID || data.is_empty() {
            return err!(LedgerError::NotInitialized);
        }

        let state = GlobalState::try_deserialize(&mut &data[..])?;
        require!(state.initialized, LedgerError::NotInitialized);

        Ok(state)
    }
}

/// A single staker's balance.
/// PDA seeds: ["user_stake", staker]
#[account]
#[derive(InitSpace, Default)]
pub struct UserStake {
    /// Owner of this record; `Pubkey::default()` until the first deposit
    pub staker: Pubkey,
    /// Current balance in lamports, always `<= MAX_STAKE`
    pub amount: u64,
    /// Canonical PDA bump
    pub bump: u8,
}

impl UserStake {
    /// Add `amount` to the balance and return the new total.
    ///
    /// Checks run in a fixed order: `InvalidAmount`, `MaxStakeExceeded`,
    /// `NotStakeOwner`. Nothing is written unless all of them pass.
    pub fn deposit(&mut self, staker: Pubkey, amount: u64, bump: u8) -> Result<u64> {
        require!(amount > 0, LedgerError::InvalidAmount);

        // SECURITY: cap the post-deposit total, not the increment. An overflow
        // is by definition past the cap.
        let new_total = self.amount.checked_add(amount).ok_or(LedgerError::MaxStakeExceeded)?;
        require!(new_total <= MAX_STAKE, LedgerError::MaxStakeExceeded);

        let fresh = self.is_unclaimed();
        if !fresh {
            require_keys_eq!(self.staker, staker, LedgerError::NotStakeOwner);
        }

        if fresh {
            self.staker = staker;
            self.bump = bump;
        }
        self.amount = new_total;

        Ok(new_total)
    }

    /// Subtract `amount` from the balance and return what is left.
    ///
    /// A record that was never staked into has a zero balance, so it fails
    /// with `InsufficientBalance` like any other over-withdrawal.
    pub fn withdraw(&mut self, staker: Pubkey, amount: u64) -> Result<u64> {
        require!(amount > 0, LedgerError::InvalidAmount);

        let remaining = self.amount.checked_sub(amount).ok_or(LedgerError::InsufficientBalance)?;
        require_keys_eq!(self.staker, staker, LedgerError::NotStakeOwner);

        self.amount = remaining;

        Ok(remaining)
    }

    /// How much more this staker may deposit before hitting the cap.
    pub fn remaining_capacity(&self) -> u64 {
        MAX_STAKE.saturating_sub(self.amount)
    }

    fn is_unclaimed(&self) -> bool {
        self.staker == Pubkey::default()
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[event]
pub struct InitializeEvent {
    pub message: String,
    pub signer: Pubkey,
    pub mint: Pubkey,
}

#[event]
pub struct StakeEvent {
    pub staker: Pubkey,
    pub amount: u64,
    pub total_staked: u64,
}

#[event]
pub struct UnstakeEvent {
    pub staker: Pubkey,
    pub amount: u64,
    pub total_staked: u64,
}

// ============================================================================
// ERROR CODES
// ============================================================================

/// Codes start at Anchor's 6000 offset, in declaration order.
#[error_code]
pub enum LedgerError {
    #[msg("Only owner can call this function!")]
    NotOwner,

    #[msg("Global state already initialized!")]
    AlreadyInitialized,

    #[msg("Global state not initialized!")]
    NotInitialized,

    /// Unreachable through a correctly derived PDA; still checked on every write.
    #[msg("User attempting to modify stake balance they do not control!")]
    NotStakeOwner,

    #[msg("Invalid amount!")]
    InvalidAmount,

    #[msg("Stake amount exceeds maximum allowed!")]
    MaxStakeExceeded,

    #[msg("Insufficient balance in user stake account to withdraw")]
    InsufficientBalance,
}

// ============================================================================
// INSTRUCTION CONTEXTS
// ============================================================================

/// `init_if_needed` lets a second `initialize` reach the handler, where it is
/// rejected with `AlreadyInitialized` instead of a system-program error.
#[derive(Accounts)]
pub struct Initialize<'info> {
    #[account(mut)]
    pub signer: Signer<'info>,

    #[account(
        init_if_needed,
        payer = signer,
        space = DISCRIMINATOR_SIZE + GlobalState::INIT_SPACE,
        seeds = [GLOBAL_STATE_SEED],
        bump
    )]
    pub global_state: Account<'info, GlobalState>,

    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct Stake<'info> {
    #[account(mut)]
    pub staker: Signer<'info>,

    /// CHECK: PDA address enforced by seeds; contents validated by
    /// `GlobalState::load` so an absent record maps to `NotInitialized`.
    #[account(seeds = [GLOBAL_STATE_SEED], bump)]
    pub global_state: UncheckedAccount<'info>,

    #[account(
        init_if_needed,
        payer = staker,
        space = DISCRIMINATOR_SIZE + UserStake::INIT_SPACE,
        seeds = [USER_STAKE_SEED, staker.key().as_ref()],
        bump
    )]
    pub user_stake: Account<'info, UserStake>,

    pub system_program: Program<'info, System>,
}

/// Same shape as `Stake`. A withdrawal against a record that does not exist
/// yet fails inside the handler with `InsufficientBalance`, and the
/// transaction rollback discards the account Anchor created for it.
#[derive(Accounts)]
pub struct Unstake<'info> {
    #[account(mut)]
    pub staker: Signer<'info>,

    /// CHECK: PDA address enforced by seeds; contents validated by
    /// `GlobalState::load`.
    #[account(seeds = [GLOBAL_STATE_SEED], bump)]
    pub global_state: UncheckedAccount<'info>,

    #[account(
        init_if_needed,
        payer = staker,
        space = DISCRIMINATOR_SIZE + UserStake::INIT_SPACE,
        seeds = [USER_STAKE_SEED, staker.key().as_ref()],
        bump
    )]
    pub user_stake: Account<'info, UserStake>,

    pub system_program: Program<'info, System>,
}

// ============================================================================
// TESTS
// ============================================================================
