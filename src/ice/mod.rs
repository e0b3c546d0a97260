mod candidate;
mod session;
mod socket;

pub use candidate::{Candidate, CandidateType, candidate_set_crc, pair_priority};
pub use session::{
    IceControl, IceSession, IceSessionObserver, IceSessionOptions, IceSessionState,
    KeepAliveOptions, RemoteParty,
};
pub use socket::{
    IceSocket, IceSocketObserver, IceSocketOptions, IceSocketState, TurnServerConfig,
};
