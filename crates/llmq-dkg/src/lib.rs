//! LLMQ DKG - distributed key generation rounds
//!
//! Every quorum interval, the members selected for a quorum run a
//! Feldman-style DKG over the chain's phase schedule:
//!
//! 1. **Contribute**: deal a random polynomial, one encrypted share per member
//! 2. **Complain**: vote against silent dealers, complain about bad shares
//! 3. **Justify**: reveal disputed shares in the clear
//! 4. **Commit**: sign the resulting quorum key with the operator key and
//!    with the new key share
//! 5. **Finalize**: aggregate matching commitments into `FinalCommitment`s
//!
//! `DkgSessionManager` owns one `DkgSessionHandler` task per quorum type;
//! each handler drives a fresh `DkgSession` per interval.

/// Verified contribution persistence
pub mod contributions;

/// Share encryption between operator keys
pub mod encryption;

/// Phase driver
pub mod handler;

/// Handler ownership and routing
pub mod manager;

/// Wire messages
pub mod messages;

/// Inbound message queues
pub mod pending;

/// Round state machine
pub mod session;

/// Fault injection
pub mod simulation;

pub use contributions::ContributionStore;
pub use handler::{CommitmentSink, DkgSessionHandler, HandlerDeps, QuorumPhase};
pub use manager::{DkgManagerDeps, DkgSessionManager, VerifiedContributions};
pub use messages::{
    DkgComplaint, DkgContribution, DkgJustification, DkgMessage, DkgPrematureCommitment, MessageHeader,
};
pub use pending::{PendingMessages, LOCAL_PEER};
pub use session::{batch_verify_message_sigs, valid_set_key, DkgSession, PreVerify, SessionDeps};
pub use simulation::{SimulatedErrorKind, SimulatedErrors};
