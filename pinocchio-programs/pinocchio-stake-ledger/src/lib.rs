//! # Pinocchio Stake Ledger Program
//!
//! Pinocchio build of the stake ledger: the same three instructions, the same
//! error codes and the same check order as the Anchor program, with every
//! constraint spelled out by hand.
//!
//! ## Framework Comparison: Anchor vs Pinocchio
//!
//! | Anchor | Pinocchio |
//! |--------|-----------|
//! | `Signer<'info>` | `account.is_signer()` |
//! | `Account<'info, T>` | `account.owned_by(program_id)` + `T::try_from_slice` |
//! | `seeds = [...], bump` | `find_program_address(&[...], program_id)` then compare |
//! | `init_if_needed` | system-owned PDA is created with `invoke_signed` after all checks pass |
//! | `#[error_code]` | `#[repr(u32)]` enum + `From<LedgerError> for ProgramError` |
//! | `emit!` / `msg!` | `log!` |
//!
//! ## Instruction Data
//!
//! | Discriminator | Instruction | Payload |
//! |---------------|-------------|---------|
//! | 0 | initialize | mint (32 bytes) |
//! | 1 | stake | amount (u64, little-endian) |
//! | 2 | unstake | amount (u64, little-endian) |
//!
//! Each handler validates the accounts, then runs the ledger transition on a
//! decoded copy (`apply_initialize`, `apply_stake`, `apply_unstake`). Only a
//! transition that succeeds creates an account or writes bytes back.

#![allow(unexpected_cfgs)]

#[cfg(not(feature = "no-entrypoint"))]
use pinocchio::entrypoint;
use pinocchio::{
    cpi::{invoke, invoke_signed, Seed, Signer},
    error::ProgramError,
    instruction::{InstructionAccount, InstructionView},
    AccountView, Address, ProgramResult,
};
use solana_program_log::log;

#[cfg(target_os = "solana")]
use pinocchio::syscalls;

// =============================================================================
// PROGRAM ID
// =============================================================================

/// Program ID: HRj7ZwkdVbj9Fzj9XWihAiSnkio4njxp5vRLsYUdGUAT
pub const ID: Address = Address::new_from_array([
    0xf4, 0x10, 0x8c, 0x3e, 0xcd, 0x30, 0xf8, 0x75, 0xdd, 0x5e, 0x81, 0x68, 0xe8, 0xa1, 0x81, 0xb2,
    0x8e, 0xd8, 0x9b, 0xf7, 0x26, 0x0e, 0x0b, 0xe6, 0xc4, 0xfd, 0xef, 0xc9, 0x11, 0xdb, 0x41, 0x28,
]);

/// System Program ID: 11111111111111111111111111111111
pub const SYSTEM_PROGRAM_ID: Address = Address::new_from_array([0u8; 32]);

// =============================================================================
// CONSTANTS
// =============================================================================

/// The only key allowed to run `initialize`: J6pjqSZXcppQeYWK1D8fL5uTJgeksSA14nEAdYjuTQpj
pub const OWNER: Address = Address::new_from_array([
    0xfe, 0x14, 0x8f, 0x57, 0x92, 0x5b, 0x16, 0x1f, 0x4f, 0x34, 0xdb, 0x7e, 0xfa, 0x64, 0x9b, 0x2d,
    0x46, 0x8a, 0x7b, 0xb6, 0xc6, 0x0c, 0x68, 0x23, 0x7d, 0x16, 0x69, 0xcf, 0xc6, 0x93, 0x37, 0x5c,
]);

/// Maximum cumulative stake per staker: 1 SOL in lamports.
pub const MAX_STAKE: u64 = 1_000_000_000;

/// GlobalState account size (no Anchor discriminator):
/// - initialized (bool): 1 byte
/// - mint (Address): 32 bytes
/// - authority (Address): 32 bytes
/// - bump (u8): 1 byte
///
/// Total: 66 bytes
pub const GLOBAL_STATE_SIZE: usize = 1 + 32 + 32 + 1;

/// UserStake account size (no Anchor discriminator):
/// - staker (Address): 32 bytes
/// - amount (u64): 8 bytes
/// - bump (u8): 1 byte
///
/// Total: 41 bytes
pub const USER_STAKE_SIZE: usize = 32 + 8 + 1;

/// Seed for the global state PDA
pub const GLOBAL_STATE_SEED: &[u8] = b"global_state";

/// Seed prefix for user stake PDAs
pub const USER_STAKE_SEED: &[u8] = b"user_stake";

pub const INITIALIZE_DISCRIMINATOR: u8 = 0;
pub const STAKE_DISCRIMINATOR: u8 = 1;
pub const UNSTAKE_DISCRIMINATOR: u8 = 2;

/// Rent parameters of the default `Rent` sysvar. `minimum_balance` is
/// `(overhead + data_len) * lamports_per_byte_year * exemption_threshold`.
pub const ACCOUNT_STORAGE_OVERHEAD: u64 = 128;
pub const LAMPORTS_PER_BYTE_YEAR: u64 = 3_480;
pub const EXEMPTION_THRESHOLD_YEARS: u64 = 2;

/// System program instruction indices (u32, little-endian)
const SYSTEM_CREATE_ACCOUNT: u32 = 0;
const SYSTEM_ASSIGN: u32 = 1;
const SYSTEM_TRANSFER: u32 = 2;
const SYSTEM_ALLOCATE: u32 = 8;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Ledger failures. Numbered from 6000 so clients see the same codes from
/// either build of the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LedgerError {
    /// `initialize` signed by someone other than `OWNER`
    NotOwner = 6000,
    /// `initialize` against a global state that is already live
    AlreadyInitialized = 6001,
    /// `stake` / `unstake` before `initialize`
    NotInitialized = 6002,
    /// Stake record belongs to a different staker
    NotStakeOwner = 6003,
    /// Zero amount
    InvalidAmount = 6004,
    /// Deposit would push the running total past `MAX_STAKE`
    MaxStakeExceeded = 6005,
    /// Withdrawal larger than the current balance
    InsufficientBalance = 6006,
}

impl From<LedgerError> for ProgramError {
    fn from(e: LedgerError) -> Self {
        ProgramError::Custom(e as u32)
    }
}

// =============================================================================
// PDA DERIVATION
// =============================================================================

/// Find the canonical PDA for `seeds` via the runtime syscall.
#[cfg(target_os = "solana")]
fn find_program_address(seeds: &[&[u8]], program_id: &Address) -> Option<(Address, u8)> {
    let mut pda_bytes = core::mem::MaybeUninit::<[u8; 32]>::uninit();
    let mut bump_seed = u8::MAX;

    let result = unsafe {
        syscalls::sol_try_find_program_address(
            seeds as *const _ as *const u8,
            seeds.len() as u64,
            program_id as *const _ as *const u8,
            pda_bytes.as_mut_ptr() as *mut u8,
            &mut bump_seed as *mut u8,
        )
    };

    if result == 0 {
        Some((Address::new_from_array(unsafe { pda_bytes.assume_init() }), bump_seed))
    } else {
        None
    }
}

/// Off-chain stand-in for the derivation syscall.
///
/// Deterministic in `seeds` and `program_id` so handler-side address checks
/// can be exercised in unit tests. It is not a real PDA derivation and never
/// runs on-chain.
#[cfg(not(target_os = "solana"))]
fn find_program_address(seeds: &[&[u8]], program_id: &Address) -> Option<(Address, u8)> {
    let mut result = [0u8; 32];
    let bytes = seeds.iter().flat_map(|seed| seed.iter()).chain(program_id.as_ref().iter());

    for (i, byte) in bytes.enumerate() {
        result[i % 32] ^= byte;
        result[(i + 7) % 32] = result[(i + 7) % 32].wrapping_add(*byte);
    }

    Some((Address::new_from_array(result), u8::MAX))
}

/// Check `address` is the canonical PDA for `seeds` and return the bump.
pub fn check_pda(address: &Address, seeds: &[&[u8]], program_id: &Address) -> Result<u8, ProgramError> {
    let (expected, bump) =
        find_program_address(seeds, program_id).ok_or(ProgramError::InvalidSeeds)?;

    if address != &expected {
        log!("REJECTION: account is not the expected PDA");
        return Err(ProgramError::InvalidSeeds);
    }

    Ok(bump)
}

// =============================================================================
// DATA STRUCTURES
// =============================================================================

/// Program-wide configuration.
/// PDA seeds: `["global_state"]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalState {
    /// Set on the first successful `initialize`, never cleared
    pub initialized: bool,
    /// Mint the ledger is denominated against
    pub mint: Address,
    /// Key that ran `initialize`
    pub authority: Address,
    /// Canonical PDA bump
    pub bump: u8,
}

impl GlobalState {
    /// State of a global-state account that does not exist yet.
    pub fn empty() -> Self {
        Self {
            initialized: false,
            mint: Address::new_from_array([0u8; 32]),
            authority: Address::new_from_array([0u8; 32]),
            bump: 0,
        }
    }

    /// Deserialize GlobalState from raw account data bytes.
    pub fn try_from_slice(data: &[u8]) -> Result<Self, ProgramError> {
        if data.len() < GLOBAL_STATE_SIZE {
            return Err(ProgramError::InvalidAccountData);
        }

        let initialized = match data[0] {
            0 => false,
            1 => true,
            _ => return Err(ProgramError::InvalidAccountData),
        };

        let mint = Address::new_from_array(
            data[1..33].try_into().map_err(|_| ProgramError::InvalidAccountData)?,
        );

        let authority = Address::new_from_array(
            data[33..65].try_into().map_err(|_| ProgramError::InvalidAccountData)?,
        );

        let bump = data[65];

        Ok(Self { initialized, mint, authority, bump })
    }

    /// Serialize GlobalState into raw account data bytes.
    pub fn serialize(&self, data: &mut [u8]) -> Result<(), ProgramError> {
        if data.len() < GLOBAL_STATE_SIZE {
            return Err(ProgramError::AccountDataTooSmall);
        }

        data[0] = self.initialized as u8;
        data[1..33].copy_from_slice(self.mint.as_ref());
        data[33..65].copy_from_slice(self.authority.as_ref());
        data[65] = self.bump;

        Ok(())
    }

    /// Apply `initialize`. `NotOwner` is checked before `AlreadyInitialized`.
    pub fn initialize(&mut self, signer: &Address, mint: Address, bump: u8) -> Result<(), LedgerError> {
        if signer != &OWNER {
            return Err(LedgerError::NotOwner);
        }
        if self.initialized {
            return Err(LedgerError::AlreadyInitialized);
        }

        self.initialized = true;
        self.mint = mint;
        self.authority = Address::new_from_array(*signer.as_array());
        self.bump = bump;

        Ok(())
    }

    pub fn require_initialized(&self) -> Result<(), LedgerError> {
        if self.initialized {
            Ok(())
        } else {
            Err(LedgerError::NotInitialized)
        }
    }
}

/// A single staker's balance.
/// PDA seeds: `["user_stake", staker]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStake {
    /// Owner of this record; all zeroes until the first deposit
    pub staker: Address,
    /// Current balance in lamports, always `<= MAX_STAKE`
    pub amount: u64,
    /// Canonical PDA bump
    pub bump: u8,
}

impl UserStake {
    /// State of a stake record that does not exist yet.
    pub fn empty() -> Self {
        Self { staker: Address::new_from_array([0u8; 32]), amount: 0, bump: 0 }
    }

    /// Deserialize UserStake from raw account data bytes.
    pub fn try_from_slice(data: &[u8]) -> Result<Self, ProgramError> {
        if data.len() < USER_STAKE_SIZE {
            return Err(ProgramError::InvalidAccountData);
        }

        let staker = Address::new_from_array(
            data[0..32].try_into().map_err(|_| ProgramError::InvalidAccountData)?,
        );

        let amount = u64::from_le_bytes(
            data[32..40].try_into().map_err(|_| ProgramError::InvalidAccountData)?,
        );

        let bump = data[40];

        Ok(Self { staker, amount, bump })
    }

    /// Serialize UserStake into raw account data bytes.
    pub fn serialize(&self, data: &mut [u8]) -> Result<(), ProgramError> {
        if data.len() < USER_STAKE_SIZE {
            return Err(ProgramError::AccountDataTooSmall);
        }

        data[0..32].copy_from_slice(self.staker.as_ref());
        data[32..40].copy_from_slice(&self.amount.to_le_bytes());
        data[40] = self.bump;

        Ok(())
    }

    /// Add `amount` and return the new total. Writes nothing on failure.
    pub fn deposit(&mut self, staker: &Address, amount: u64, bump: u8) -> Result<u64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        // SECURITY: the cap applies to the post-deposit total; overflow is past the cap.
        let new_total = self.amount.checked_add(amount).ok_or(LedgerError::MaxStakeExceeded)?;
        if new_total > MAX_STAKE {
            return Err(LedgerError::MaxStakeExceeded);
        }

        let unclaimed = self.is_unclaimed();
        if !unclaimed && &self.staker != staker {
            return Err(LedgerError::NotStakeOwner);
        }

        if unclaimed {
            self.staker = Address::new_from_array(*staker.as_array());
            self.bump = bump;
        }
        self.amount = new_total;

        Ok(new_total)
    }

    /// Subtract `amount` and return the remaining balance. Writes nothing on failure.
    pub fn withdraw(&mut self, staker: &Address, amount: u64) -> Result<u64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let remaining = self.amount.checked_sub(amount).ok_or(LedgerError::InsufficientBalance)?;
        if &self.staker != staker {
            return Err(LedgerError::NotStakeOwner);
        }

        self.amount = remaining;

        Ok(remaining)
    }

    pub fn remaining_capacity(&self) -> u64 {
        MAX_STAKE.saturating_sub(self.amount)
    }

    fn is_unclaimed(&self) -> bool {
        self.staker.as_array() == &[0u8; 32]
    }
}

// =============================================================================
// LEDGER TRANSITIONS
// =============================================================================
//
// Raw account data in, new record out. `None` stands for an account that has
// not been created yet. The handlers call these before any CPI or write.

/// Run `initialize` against the current global-state bytes.
pub fn apply_initialize(
    state_data: Option<&[u8]>,
    signer: &Address,
    mint: Address,
    bump: u8,
) -> Result<GlobalState, ProgramError> {
    let mut global_state = match state_data {
        Some(data) => GlobalState::try_from_slice(data)?,
        None => GlobalState::empty(),
    };

    global_state.initialize(signer, mint, bump)?;

    Ok(global_state)
}

fn load_live_global_state(global_data: Option<&[u8]>) -> Result<GlobalState, ProgramError> {
    let global_state = match global_data {
        Some(data) => GlobalState::try_from_slice(data)?,
        None => GlobalState::empty(),
    };
    global_state.require_initialized()?;

    Ok(global_state)
}

fn load_user_stake(stake_data: Option<&[u8]>) -> Result<UserStake, ProgramError> {
    match stake_data {
        Some(data) => UserStake::try_from_slice(data),
        None => Ok(UserStake::empty()),
    }
}

/// Run `stake`: `NotInitialized`, then the deposit checks.
pub fn apply_stake(
    global_data: Option<&[u8]>,
    stake_data: Option<&[u8]>,
    staker: &Address,
    amount: u64,
    bump: u8,
) -> Result<UserStake, ProgramError> {
    load_live_global_state(global_data)?;

    let mut user_stake = load_user_stake(stake_data)?;
    user_stake.deposit(staker, amount, bump)?;

    Ok(user_stake)
}

/// Run `unstake`: `NotInitialized`, then the withdrawal checks. A record that
/// does not exist yet behaves as a zero balance.
pub fn apply_unstake(
    global_data: Option<&[u8]>,
    stake_data: Option<&[u8]>,
    staker: &Address,
    amount: u64,
) -> Result<UserStake, ProgramError> {
    load_live_global_state(global_data)?;

    let mut user_stake = load_user_stake(stake_data)?;
    user_stake.withdraw(staker, amount)?;

    Ok(user_stake)
}

// =============================================================================
// SYSTEM PROGRAM CPI
// =============================================================================

pub fn rent_exempt_minimum(data_len: usize) -> u64 {
    (ACCOUNT_STORAGE_OVERHEAD + data_len as u64) * LAMPORTS_PER_BYTE_YEAR * EXEMPTION_THRESHOLD_YEARS
}

/// `CreateAccount { lamports, space, owner }`
pub fn create_account_data(lamports: u64, space: u64, owner: &Address) -> [u8; 52] {
    let mut data = [0u8; 52];
    data[0..4].copy_from_slice(&SYSTEM_CREATE_ACCOUNT.to_le_bytes());
    data[4..12].copy_from_slice(&lamports.to_le_bytes());
    data[12..20].copy_from_slice(&space.to_le_bytes());
    data[20..52].copy_from_slice(owner.as_ref());
    data
}

fn transfer_data(lamports: u64) -> [u8; 12] {
    let mut data = [0u8; 12];
    data[0..4].copy_from_slice(&SYSTEM_TRANSFER.to_le_bytes());
    data[4..12].copy_from_slice(&lamports.to_le_bytes());
    data
}

fn allocate_data(space: u64) -> [u8; 12] {
    let mut data = [0u8; 12];
    data[0..4].copy_from_slice(&SYSTEM_ALLOCATE.to_le_bytes());
    data[4..12].copy_from_slice(&space.to_le_bytes());
    data
}

fn assign_data(owner: &Address) -> [u8; 36] {
    let mut data = [0u8; 36];
    data[0..4].copy_from_slice(&SYSTEM_ASSIGN.to_le_bytes());
    data[4..36].copy_from_slice(owner.as_ref());
    data
}

/// Create a program-owned PDA the way Anchor's `init` does.
///
/// A PDA has no private key, so the program signs for it with `signer_seeds`.
/// An address that already holds lamports cannot go through `CreateAccount`;
/// it is topped up to rent exemption, then allocated and assigned instead.
fn create_pda_account<const N: usize>(
    payer: &AccountView,
    account: &AccountView,
    space: usize,
    owner: &Address,
    signer_seeds: &[Seed; N],
) -> ProgramResult {
    let required = rent_exempt_minimum(space);
    let current = account.lamports();

    if current == 0 {
        let data = create_account_data(required, space as u64, owner);
        let accounts = [
            InstructionAccount::writable_signer(payer.address()),
            InstructionAccount::writable_signer(account.address()),
        ];
        let instruction =
            InstructionView { program_id: &SYSTEM_PROGRAM_ID, accounts: &accounts, data: &data };

        return invoke_signed::<2>(&instruction, &[payer, account], &[Signer::from(signer_seeds)]);
    }

    if current < required {
        let data = transfer_data(required - current);
        let accounts = [
            InstructionAccount::writable_signer(payer.address()),
            InstructionAccount::writable(account.address()),
        ];
        let instruction =
            InstructionView { program_id: &SYSTEM_PROGRAM_ID, accounts: &accounts, data: &data };
        invoke::<2>(&instruction, &[payer, account])?;
    }

    let accounts = [InstructionAccount::writable_signer(account.address())];

    let data = allocate_data(space as u64);
    let instruction =
        InstructionView { program_id: &SYSTEM_PROGRAM_ID, accounts: &accounts, data: &data };
    invoke_signed::<1>(&instruction, &[account], &[Signer::from(signer_seeds)])?;

    let data = assign_data(owner);
    let instruction =
        InstructionView { program_id: &SYSTEM_PROGRAM_ID, accounts: &accounts, data: &data };
    invoke_signed::<1>(&instruction, &[account], &[Signer::from(signer_seeds)])
}

// =============================================================================
// INSTRUCTIONS
// =============================================================================

/// Decoded instruction data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerInstruction {
    Initialize { mint: Address },
    Stake { amount: u64 },
    Unstake { amount: u64 },
}

impl LedgerInstruction {
    pub fn unpack(instruction_data: &[u8]) -> Result<Self, ProgramError> {
        let (discriminator, data) =
            instruction_data.split_first().ok_or(ProgramError::InvalidInstructionData)?;

        match *discriminator {
            INITIALIZE_DISCRIMINATOR => {
                let mint: [u8; 32] = data
                    .get(..32)
                    .and_then(|bytes| bytes.try_into().ok())
                    .ok_or(ProgramError::InvalidInstructionData)?;
                Ok(Self::Initialize { mint: Address::new_from_array(mint) })
            }
            STAKE_DISCRIMINATOR => Ok(Self::Stake { amount: parse_amount(data)? }),
            UNSTAKE_DISCRIMINATOR => Ok(Self::Unstake { amount: parse_amount(data)? }),
            _ => Err(ProgramError::InvalidInstructionData),
        }
    }
}

fn parse_amount(data: &[u8]) -> Result<u64, ProgramError> {
    let bytes: [u8; 8] = data
        .get(..8)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(ProgramError::InvalidInstructionData)?;
    Ok(u64::from_le_bytes(bytes))
}

fn reject(instruction: &str, err: ProgramError) -> ProgramError {
    if let ProgramError::Custom(code) = err {
        log!("REJECTION: {} failed with code {}", instruction, code);
    }
    err
}

// =============================================================================
// ENTRYPOINT
// =============================================================================

#[cfg(not(feature = "no-entrypoint"))]
entrypoint!(process_instruction);

pub fn process_instruction(
    program_id: &Address,
    accounts: &[AccountView],
    instruction_data: &[u8],
) -> ProgramResult {
    match LedgerInstruction::unpack(instruction_data)? {
        LedgerInstruction::Initialize { mint } => initialize(program_id, accounts, mint),
        LedgerInstruction::Stake { amount } => stake(program_id, accounts, amount),
        LedgerInstruction::Unstake { amount } => unstake(program_id, accounts, amount),
    }
}

/// Create and initialize the global state.
///
/// # Accounts
/// 0. `[writable]` global_state - PDA `["global_state"]`
/// 1. `[writable, signer]` signer - must be `OWNER`, pays for the account
/// 2. `[]` system_program
fn initialize(program_id: &Address, accounts: &[AccountView], mint: Address) -> ProgramResult {
    let [global_state_acc, signer, system_program] = accounts else {
        return Err(ProgramError::NotEnoughAccountKeys);
    };

    log!("Instruction: Initialize");

    if !signer.is_signer() {
        return Err(ProgramError::MissingRequiredSignature);
    }

    if system_program.address() != &SYSTEM_PROGRAM_ID {
        return Err(ProgramError::IncorrectProgramId);
    }

    let bump = check_pda(global_state_acc.address(), &[GLOBAL_STATE_SEED], program_id)?;

    let exists = global_state_acc.owned_by(program_id);
    if !exists && !global_state_acc.owned_by(&SYSTEM_PROGRAM_ID) {
        return Err(ProgramError::IllegalOwner);
    }

    let global_state = if exists {
        let state_data = global_state_acc.try_borrow()?;
        apply_initialize(Some(&state_data[..]), signer.address(), mint, bump)
    } else {
        apply_initialize(None, signer.address(), mint, bump)
    }
    .map_err(|e| reject("initialize", e))?;

    if !exists {
        let bump_bytes = [bump];
        let seeds = [Seed::from(GLOBAL_STATE_SEED), Seed::from(&bump_bytes)];
        create_pda_account(signer, global_state_acc, GLOBAL_STATE_SIZE, program_id, &seeds)?;
    }

    let mut state_data = global_state_acc.try_borrow_mut()?;
    global_state.serialize(&mut state_data)?;

    log!("Global state initialized, bump {}", bump);

    Ok(())
}

/// Accounts shared by `stake` and `unstake`, validated.
///
/// # Accounts
/// 0. `[]` global_state - PDA `["global_state"]`
/// 1. `[writable]` user_stake - PDA `["user_stake", staker]`
/// 2. `[writable, signer]` staker - pays for the record on first stake
/// 3. `[]` system_program
struct StakeAccounts<'a> {
    global_state: &'a AccountView,
    user_stake: &'a AccountView,
    staker: &'a AccountView,
    user_stake_exists: bool,
    bump: u8,
}

impl<'a> StakeAccounts<'a> {
    fn load(program_id: &Address, accounts: &'a [AccountView]) -> Result<Self, ProgramError> {
        let [global_state, user_stake, staker, system_program] = accounts else {
            return Err(ProgramError::NotEnoughAccountKeys);
        };

        if !staker.is_signer() {
            return Err(ProgramError::MissingRequiredSignature);
        }

        if system_program.address() != &SYSTEM_PROGRAM_ID {
            return Err(ProgramError::IncorrectProgramId);
        }

        check_pda(global_state.address(), &[GLOBAL_STATE_SEED], program_id)?;
        let bump = check_pda(
            user_stake.address(),
            &[USER_STAKE_SEED, staker.address().as_ref()],
            program_id,
        )?;

        let user_stake_exists = user_stake.owned_by(program_id);
        if !user_stake_exists && !user_stake.owned_by(&SYSTEM_PROGRAM_ID) {
            return Err(ProgramError::IllegalOwner);
        }

        Ok(Self { global_state, user_stake, staker, user_stake_exists, bump })
    }

    /// Run `transition` over the current bytes of both records. A global
    /// state the program does not own reads as not created.
    fn apply<F>(&self, program_id: &Address, transition: F) -> Result<UserStake, ProgramError>
    where
        F: FnOnce(Option<&[u8]>, Option<&[u8]>) -> Result<UserStake, ProgramError>,
    {
        let global_data =
            if self.global_state.owned_by(program_id) { Some(self.global_state.try_borrow()?) } else { None };
        let stake_data =
            if self.user_stake_exists { Some(self.user_stake.try_borrow()?) } else { None };

        transition(global_data.as_deref(), stake_data.as_deref())
    }
}

/// Deposit `amount` into the signer's stake record, creating it on first use.
fn stake(program_id: &Address, accounts: &[AccountView], amount: u64) -> ProgramResult {
    log!("Instruction: Stake");

    let ctx = StakeAccounts::load(program_id, accounts)?;
    let staker = ctx.staker.address();

    let user_stake = ctx
        .apply(program_id, |global, record| apply_stake(global, record, staker, amount, ctx.bump))
        .map_err(|e| reject("stake", e))?;

    if !ctx.user_stake_exists {
        let bump_bytes = [ctx.bump];
        let seeds =
            [Seed::from(USER_STAKE_SEED), Seed::from(staker.as_ref()), Seed::from(&bump_bytes)];
        create_pda_account(ctx.staker, ctx.user_stake, USER_STAKE_SIZE, program_id, &seeds)?;
    }

    let mut stake_data = ctx.user_stake.try_borrow_mut()?;
    user_stake.serialize(&mut stake_data)?;

    log!(
        "After stake - balance: {}, remaining capacity: {}",
        user_stake.amount,
        user_stake.remaining_capacity()
    );

    Ok(())
}

/// Withdraw `amount` from the signer's stake record. A full withdrawal leaves
/// the record in place with a zero balance.
fn unstake(program_id: &Address, accounts: &[AccountView], amount: u64) -> ProgramResult {
    log!("Instruction: Unstake");

    let ctx = StakeAccounts::load(program_id, accounts)?;
    let staker = ctx.staker.address();

    let user_stake = ctx
        .apply(program_id, |global, record| apply_unstake(global, record, staker, amount))
        .map_err(|e| reject("unstake", e))?;

    // A successful withdrawal implies a non-zero balance, so the record exists.
    let mut stake_data = ctx.user_stake.try_borrow_mut()?;
    user_stake.serialize(&mut stake_data)?;

    log!("After unstake - balance: {}", user_stake.amount);

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> Address {
        Address::new_from_array([byte; 32])
    }

    fn live_global_bytes() -> [u8; GLOBAL_STATE_SIZE] {
        let state = apply_initialize(None, &OWNER, key(9), 255).unwrap();
        let mut buffer = [0u8; GLOBAL_STATE_SIZE];
        state.serialize(&mut buffer).unwrap();
        buffer
    }

    fn stake_bytes(user: &UserStake) -> [u8; USER_STAKE_SIZE] {
        let mut buffer = [0u8; USER_STAKE_SIZE];
        user.serialize(&mut buffer).unwrap();
        buffer
    }

    fn assert_ledger_err<T: core::fmt::Debug>(result: Result<T, ProgramError>, expected: LedgerError) {
        match result {
            Err(ProgramError::Custom(code)) => assert_eq!(code, expected as u32),
            other => panic!("expected {:?}, got {:?}", expected, other),
        }
    }

    #[test]
    fn test_global_state_serialization() {
        let state = GlobalState { initialized: true, mint: key(7), authority: OWNER, bump: 254 };

        let mut buffer = [0u8; GLOBAL_STATE_SIZE];
        state.serialize(&mut buffer).unwrap();

        assert_eq!(GlobalState::try_from_slice(&buffer).unwrap(), state);
    }

    #[test]
    fn test_user_stake_serialization() {
        let user = UserStake { staker: key(2), amount: 400_000_000, bump: 253 };
        assert_eq!(UserStake::try_from_slice(&stake_bytes(&user)).unwrap(), user);
    }

    #[test]
    fn test_short_buffers_rejected() {
        assert!(GlobalState::try_from_slice(&[0u8; GLOBAL_STATE_SIZE - 1]).is_err());
        assert!(UserStake::try_from_slice(&[0u8; 10]).is_err());

        let mut short = [0u8; 4];
        assert!(UserStake::empty().serialize(&mut short).is_err());
    }

    #[test]
    fn test_corrupt_initialized_flag_rejected() {
        let mut buffer = [0u8; GLOBAL_STATE_SIZE];
        buffer[0] = 2;
        assert!(matches!(
            GlobalState::try_from_slice(&buffer),
            Err(ProgramError::InvalidAccountData)
        ));
    }

    #[test]
    fn test_fresh_account_is_not_initialized() {
        assert_eq!(GlobalState::empty().require_initialized(), Err(LedgerError::NotInitialized));
        let zeroed = GlobalState::try_from_slice(&[0u8; GLOBAL_STATE_SIZE]).unwrap();
        assert_eq!(zeroed, GlobalState::empty());
    }

    #[test]
    fn test_initialize_by_owner() {
        let state = apply_initialize(None, &OWNER, key(9), 255).unwrap();

        assert!(state.initialized);
        assert_eq!(state.mint, key(9));
        assert_eq!(state.authority, OWNER);
        assert_eq!(state.bump, 255);
    }

    #[test]
    fn test_initialize_twice() {
        let live = live_global_bytes();

        assert_ledger_err(
            apply_initialize(Some(&live), &OWNER, key(8), 254),
            LedgerError::AlreadyInitialized,
        );
        assert_eq!(GlobalState::try_from_slice(&live).unwrap().mint, key(9));
    }

    #[test]
    fn test_initialize_wrong_signer() {
        assert_ledger_err(apply_initialize(None, &key(3), key(9), 255), LedgerError::NotOwner);

        let live = live_global_bytes();
        assert_ledger_err(apply_initialize(Some(&live), &key(3), key(9), 255), LedgerError::NotOwner);
    }

    #[test]
    fn test_stake_before_initialize() {
        assert_ledger_err(apply_stake(None, None, &key(4), 10, 255), LedgerError::NotInitialized);

        let zeroed = [0u8; GLOBAL_STATE_SIZE];
        assert_ledger_err(
            apply_stake(Some(&zeroed), None, &key(4), 10, 255),
            LedgerError::NotInitialized,
        );
        assert_ledger_err(apply_unstake(None, None, &key(4), 10), LedgerError::NotInitialized);
    }

    #[test]
    fn test_not_initialized_checked_before_amount() {
        assert_ledger_err(apply_stake(None, None, &key(4), 0, 255), LedgerError::NotInitialized);
        assert_ledger_err(apply_unstake(None, None, &key(4), 0), LedgerError::NotInitialized);
    }

    #[test]
    fn test_zero_amounts_rejected() {
        let live = live_global_bytes();
        let staker = key(4);

        assert_ledger_err(apply_stake(Some(&live), None, &staker, 0, 255), LedgerError::InvalidAmount);
        assert_ledger_err(apply_unstake(Some(&live), None, &staker, 0), LedgerError::InvalidAmount);
    }

    #[test]
    fn test_cap_plus_one_rejected() {
        let live = live_global_bytes();
        assert_ledger_err(
            apply_stake(Some(&live), None, &key(4), MAX_STAKE + 1, 255),
            LedgerError::MaxStakeExceeded,
        );
    }

    #[test]
    fn test_cumulative_cap_across_instructions() {
        let live = live_global_bytes();
        let staker = key(4);

        let first = apply_stake(Some(&live), None, &staker, MAX_STAKE, 255).unwrap();
        let record = stake_bytes(&first);

        assert_ledger_err(
            apply_stake(Some(&live), Some(&record), &staker, 1, 255),
            LedgerError::MaxStakeExceeded,
        );
        assert_eq!(UserStake::try_from_slice(&record).unwrap().amount, MAX_STAKE);
        assert_eq!(first.remaining_capacity(), 0);
    }

    #[test]
    fn test_deposits_accumulate() {
        let live = live_global_bytes();
        let staker = key(4);

        let first = apply_stake(Some(&live), None, &staker, 200_000_000, 255).unwrap();
        let second =
            apply_stake(Some(&live), Some(&stake_bytes(&first)), &staker, 200_000_000, 255).unwrap();

        assert_eq!(second, UserStake { staker: key(4), amount: 400_000_000, bump: 255 });
    }

    #[test]
    fn test_overflow_is_max_stake_exceeded() {
        let mut user = UserStake { staker: key(4), amount: 10, bump: 255 };
        assert_eq!(user.deposit(&key(4), u64::MAX, 255), Err(LedgerError::MaxStakeExceeded));
        assert_eq!(user.amount, 10);
    }

    #[test]
    fn test_full_unstake_keeps_record() {
        let live = live_global_bytes();
        let staker = key(5);

        let staked = apply_stake(Some(&live), None, &staker, MAX_STAKE, 252).unwrap();
        let drained =
            apply_unstake(Some(&live), Some(&stake_bytes(&staked)), &staker, MAX_STAKE).unwrap();

        assert_eq!(drained, UserStake { staker: key(5), amount: 0, bump: 252 });
        assert_eq!(UserStake::try_from_slice(&stake_bytes(&drained)).unwrap().amount, 0);
    }

    #[test]
    fn test_over_withdraw_rejected() {
        let live = live_global_bytes();
        let staker = key(5);
        let record = stake_bytes(&apply_stake(Some(&live), None, &staker, 500, 255).unwrap());

        assert_ledger_err(
            apply_unstake(Some(&live), Some(&record), &staker, 501),
            LedgerError::InsufficientBalance,
        );
        assert_ledger_err(apply_unstake(Some(&live), None, &staker, 1), LedgerError::InsufficientBalance);
    }

    #[test]
    fn test_foreign_record_rejected() {
        let live = live_global_bytes();
        let record = stake_bytes(&apply_stake(Some(&live), None, &key(5), 500, 255).unwrap());

        assert_ledger_err(
            apply_stake(Some(&live), Some(&record), &key(6), 1, 255),
            LedgerError::NotStakeOwner,
        );
        assert_ledger_err(
            apply_unstake(Some(&live), Some(&record), &key(6), 1),
            LedgerError::NotStakeOwner,
        );
    }

    #[test]
    fn test_stakers_independent() {
        let mut alice = UserStake::empty();
        let mut bob = UserStake::empty();

        alice.deposit(&key(1), MAX_STAKE, 255).unwrap();
        bob.deposit(&key(2), 1, 255).unwrap();

        assert_eq!(alice.deposit(&key(1), 1, 255), Err(LedgerError::MaxStakeExceeded));
        assert_eq!(bob.deposit(&key(2), MAX_STAKE - 1, 255), Ok(MAX_STAKE));
    }

    #[test]
    fn test_pda_checks() {
        let (global_pda, bump) = find_program_address(&[GLOBAL_STATE_SEED], &ID).unwrap();
        assert_eq!(check_pda(&global_pda, &[GLOBAL_STATE_SEED], &ID).unwrap(), bump);
        assert!(matches!(
            check_pda(&key(1), &[GLOBAL_STATE_SEED], &ID),
            Err(ProgramError::InvalidSeeds)
        ));

        let staker = key(4);
        let (stake_pda, _) = find_program_address(&[USER_STAKE_SEED, staker.as_ref()], &ID).unwrap();
        assert!(check_pda(&stake_pda, &[USER_STAKE_SEED, staker.as_ref()], &ID).is_ok());
        assert!(matches!(
            check_pda(&stake_pda, &[USER_STAKE_SEED, key(5).as_ref()], &ID),
            Err(ProgramError::InvalidSeeds)
        ));
    }

    #[test]
    fn test_create_account_data_layout() {
        let data = create_account_data(1_000, GLOBAL_STATE_SIZE as u64, &ID);

        assert_eq!(u32::from_le_bytes(data[0..4].try_into().unwrap()), 0);
        assert_eq!(u64::from_le_bytes(data[4..12].try_into().unwrap()), 1_000);
        assert_eq!(u64::from_le_bytes(data[12..20].try_into().unwrap()), GLOBAL_STATE_SIZE as u64);
        assert_eq!(&data[20..52], ID.as_ref());
    }

    #[test]
    fn test_rent_exempt_minimum() {
        assert_eq!(rent_exempt_minimum(0), 890_880);
        assert_eq!(rent_exempt_minimum(USER_STAKE_SIZE), (128 + 41) * 6_960);
    }

    #[test]
    fn test_unpack_instructions() {
        let mut data = [0u8; 33];
        data[0] = INITIALIZE_DISCRIMINATOR;
        data[1..].copy_from_slice(&[7u8; 32]);
        assert_eq!(
            LedgerInstruction::unpack(&data).unwrap(),
            LedgerInstruction::Initialize { mint: key(7) }
        );

        let mut data = [0u8; 9];
        data[0] = STAKE_DISCRIMINATOR;
        data[1..].copy_from_slice(&42u64.to_le_bytes());
        assert_eq!(LedgerInstruction::unpack(&data).unwrap(), LedgerInstruction::Stake { amount: 42 });

        data[0] = UNSTAKE_DISCRIMINATOR;
        assert_eq!(LedgerInstruction::unpack(&data).unwrap(), LedgerInstruction::Unstake { amount: 42 });
    }

    #[test]
    fn test_unpack_rejects_bad_data() {
        assert!(matches!(LedgerInstruction::unpack(&[]), Err(ProgramError::InvalidInstructionData)));
        assert!(matches!(LedgerInstruction::unpack(&[9]), Err(ProgramError::InvalidInstructionData)));
        assert!(matches!(
            LedgerInstruction::unpack(&[STAKE_DISCRIMINATOR, 1, 2, 3]),
            Err(ProgramError::InvalidInstructionData)
        ));
        assert!(matches!(
            LedgerInstruction::unpack(&[INITIALIZE_DISCRIMINATOR; 16]),
            Err(ProgramError::InvalidInstructionData)
        ));
    }

    #[test]
    fn test_error_conversion() {
        let err: ProgramError = LedgerError::NotOwner.into();
        assert!(matches!(err, ProgramError::Custom(6000)));

        let err: ProgramError = LedgerError::AlreadyInitialized.into();
        assert!(matches!(err, ProgramError::Custom(6001)));

        let err: ProgramError = LedgerError::NotInitialized.into();
        assert!(matches!(err, ProgramError::Custom(6002)));

        let err: ProgramError = LedgerError::NotStakeOwner.into();
        assert!(matches!(err, ProgramError::Custom(6003)));

        let err: ProgramError = LedgerError::InvalidAmount.into();
        assert!(matches!(err, ProgramError::Custom(6004)));

        let err: ProgramError = LedgerError::MaxStakeExceeded.into();
        assert!(matches!(err, ProgramError::Custom(6005)));

        let err: ProgramError = LedgerError::InsufficientBalance.into();
        assert!(matches!(err, ProgramError::Custom(6006)));
    }
}
