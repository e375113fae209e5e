//! Invitation codes: format, generation and validation rules.
//!
//! A code is a short, case-insensitive alphanumeric token. Every code
//! belongs to exactly one session and carries its own expiry and
//! use-count limit. The rules here are pure; serialising concurrent
//! joins against one code is the [`SessionManager`]'s job.
//!
//! [`SessionManager`]: crate::session::SessionManager

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ShareError;
use crate::session::SessionId;

// ── Constants ────────────────────────────────────────────────────

/// Shortest accepted code.
pub const MIN_CODE_LEN: usize = 6;
/// Longest accepted code.
pub const MAX_CODE_LEN: usize = 8;
/// Length of generated codes unless configured otherwise.
pub const DEFAULT_CODE_LEN: usize = 6;
/// Longest lifetime a code can be given; longer policies are capped.
pub const MAX_CODE_EXPIRY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

// ── InviteCode ───────────────────────────────────────────────────

/// A normalised (upper-case) invitation code string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InviteCode(String);

impl InviteCode {
    /// Parse user input. Surrounding whitespace is ignored and letters
    /// are folded to upper case.
    pub fn parse(input: &str) -> Result<Self, ShareError> {
        let trimmed = input.trim();
        if !(MIN_CODE_LEN..=MAX_CODE_LEN).contains(&trimmed.len()) {
            return Err(ShareError::InvalidCode);
        }
        if !trimmed.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ShareError::InvalidCode);
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// Generate a random code of `len` characters (clamped to 6..=8).
    pub fn generate(len: usize) -> Self {
        Self::generate_with(&mut rand::thread_rng(), len)
    }

    /// Generate a code from an explicit RNG.
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R, len: usize) -> Self {
        let len = len.clamp(MIN_CODE_LEN, MAX_CODE_LEN);
        let code = (0..len)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InviteCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InviteCode {
    type Err = ShareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for InviteCode {
    type Error = ShareError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<InviteCode> for String {
    fn from(code: InviteCode) -> Self {
        code.0
    }
}

// ── CodePolicy ───────────────────────────────────────────────────

/// Expiry and use limits applied to a newly minted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodePolicy {
    /// Lifetime measured from creation.
    pub expiry: Duration,
    /// Maximum successful joins; `None` means unlimited.
    pub max_uses: Option<u32>,
    /// Length of generated codes.
    pub length: usize,
}

impl Default for CodePolicy {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(10 * 60),
            max_uses: None,
            length: DEFAULT_CODE_LEN,
        }
    }
}

impl CodePolicy {
    /// Same policy with an explicit use limit.
    pub fn with_max_uses(mut self, max_uses: u32) -> Self {
        self.max_uses = Some(max_uses);
        self
    }

    /// Same policy with a different lifetime.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }
}

// ── InvitationCode ───────────────────────────────────────────────

/// A code together with its admission state.
///
/// Invariant: `use_count <= max_uses` whenever a limit is set. A
/// revoked or expired code never admits anyone again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitationCode {
    pub code: InviteCode,
    pub session_id: SessionId,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
    pub max_uses: Option<u32>,
    pub use_count: u32,
    pub revoked: bool,
}

impl InvitationCode {
    /// Mint a fresh record for `session_id` at `now`.
    pub fn new(code: InviteCode, session_id: SessionId, policy: &CodePolicy, now: SystemTime) -> Self {
        // A clock too close to the end of time yields an expired code.
        let expires_at = now
            .checked_add(policy.expiry.min(MAX_CODE_EXPIRY))
            .unwrap_or(now);
        Self {
            code,
            session_id,
            created_at: now,
            expires_at,
            max_uses: policy.max_uses,
            use_count: 0,
            revoked: false,
        }
    }

    /// A code is expired from its `expires_at` instant onward.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.max_uses, Some(max) if self.use_count >= max)
    }

    /// Remaining joins, or `None` when unlimited.
    pub fn remaining_uses(&self) -> Option<u32> {
        self.max_uses.map(|max| max.saturating_sub(self.use_count))
    }

    /// Check whether the code would admit a viewer at `now`.
    ///
    /// Revocation wins over expiry, expiry wins over exhaustion.
    pub fn check_at(&self, now: SystemTime) -> Result<(), ShareError> {
        if self.revoked {
            return Err(ShareError::InvalidCode);
        }
        if self.is_expired_at(now) {
            return Err(ShareError::ExpiredCode);
        }
        if self.is_exhausted() {
            return Err(ShareError::CodeExhausted);
        }
        Ok(())
    }

    /// Check and take one use. Returns the new use count.
    ///
    /// Callers must hold the owning session's lock so that the check
    /// and the increment form one critical section.
    pub fn consume_at(&mut self, now: SystemTime) -> Result<u32, ShareError> {
        self.check_at(now)?;
        self.use_count += 1;
        Ok(self.use_count)
    }

    /// Give back a use taken by [`consume_at`](Self::consume_at) when
    /// the admission could not be completed.
    pub fn release(&mut self) {
        self.use_count = self.use_count.saturating_sub(1);
    }

    pub fn revoke(&mut self) {
        self.revoked = true;
    }

    /// Set an explicit use limit. A limit below the current use count
    /// is rejected so the invariant keeps holding.
    pub fn set_max_uses(&mut self, max_uses: Option<u32>) -> Result<(), ShareError> {
        if let Some(max) = max_uses {
            if max < self.use_count {
                return Err(ShareError::CodeExhausted);
            }
        }
        self.max_uses = max_uses;
        Ok(())
    }

    /// Snapshot for the external store.
    pub fn to_record(&self) -> CodeRecord {
        CodeRecord {
            code: self.code.clone(),
            session_id: self.session_id.get(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            max_uses: self.max_uses,
            use_count: self.use_count,
            revoked: self.revoked,
        }
    }
}

// ── CodeRecord ───────────────────────────────────────────────────

/// Persisted form of an [`InvitationCode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRecord {
    pub code: InviteCode,
    pub session_id: u64,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
    pub max_uses: Option<u32>,
    pub use_count: u32,
    pub revoked: bool,
}

impl From<CodeRecord> for InvitationCode {
    fn from(rec: CodeRecord) -> Self {
        Self {
            code: rec.code,
            session_id: SessionId::new(rec.session_id),
            created_at: rec.created_at,
            expires_at: rec.expires_at,
            max_uses: rec.max_uses,
            use_count: rec.use_count,
            revoked: rec.revoked,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn code(policy: CodePolicy) -> (InvitationCode, SystemTime) {
        let now = SystemTime::now();
        let c = InvitationCode::new(
            InviteCode::parse("AB12CD").unwrap(),
            SessionId::new(1),
            &policy,
            now,
        );
        (c, now)
    }

    #[test]
    fn parse_is_case_insensitive() {
        let a = InviteCode::parse("ab12cd").unwrap();
        let b = InviteCode::parse(" AB12cd ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "AB12CD");
    }

    #[test]
    fn parse_rejects_bad_length_and_symbols() {
        assert!(InviteCode::parse("AB12").is_err());
        assert!(InviteCode::parse("AB12CD345").is_err());
        assert!(InviteCode::parse("AB-2CD").is_err());
        assert!(InviteCode::parse("").is_err());
        assert!(InviteCode::parse("ABCDEFGH").is_ok());
    }

    #[test]
    fn generated_codes_are_valid() {
        let mut rng = StdRng::seed_from_u64(7);
        for len in [0, 6, 7, 8, 20] {
            let c = InviteCode::generate_with(&mut rng, len);
            assert!((MIN_CODE_LEN..=MAX_CODE_LEN).contains(&c.as_str().len()));
            assert_eq!(InviteCode::parse(c.as_str()).unwrap(), c);
        }
    }

    #[test]
    fn consume_until_exhausted() {
        let (mut c, now) = code(CodePolicy::default().with_max_uses(2));
        assert_eq!(c.consume_at(now).unwrap(), 1);
        assert_eq!(c.consume_at(now).unwrap(), 2);
        assert!(matches!(c.consume_at(now), Err(ShareError::CodeExhausted)));
        assert_eq!(c.use_count, 2);
        assert_eq!(c.remaining_uses(), Some(0));
    }

    #[test]
    fn unlimited_by_default() {
        let (mut c, now) = code(CodePolicy::default());
        for _ in 0..1000 {
            c.consume_at(now).unwrap();
        }
        assert_eq!(c.remaining_uses(), None);
    }

    #[test]
    fn expired_wins_over_remaining_uses() {
        let (c, now) = code(CodePolicy::default().with_max_uses(5));
        let later = now + Duration::from_secs(10 * 60);
        assert!(matches!(c.check_at(later), Err(ShareError::ExpiredCode)));
        assert!(c.check_at(now + Duration::from_secs(599)).is_ok());
    }

    #[test]
    fn revoked_is_permanently_unusable() {
        let (mut c, now) = code(CodePolicy::default());
        c.revoke();
        assert!(matches!(c.consume_at(now), Err(ShareError::InvalidCode)));
        assert_eq!(c.use_count, 0);
    }

    #[test]
    fn max_uses_cannot_drop_below_use_count() {
        let (mut c, now) = code(CodePolicy::default());
        c.consume_at(now).unwrap();
        c.consume_at(now).unwrap();
        assert!(c.set_max_uses(Some(1)).is_err());
        c.set_max_uses(Some(2)).unwrap();
        assert!(c.is_exhausted());
    }

    #[test]
    fn huge_expiry_is_capped() {
        let (c, now) = code(CodePolicy::default().with_expiry(Duration::from_secs(i64::MAX as u64)));
        assert_eq!(c.expires_at, now + MAX_CODE_EXPIRY);
        assert!(c.check_at(now).is_ok());

        let (c, now) = code(CodePolicy::default().with_expiry(Duration::MAX));
        assert_eq!(c.expires_at, now + MAX_CODE_EXPIRY);
    }

    #[test]
    fn record_roundtrip_preserves_state() {
        let (mut c, now) = code(CodePolicy::default().with_max_uses(3));
        c.consume_at(now).unwrap();
        let back: InvitationCode = c.to_record().into();
        assert_eq!(back, c);
    }
}
