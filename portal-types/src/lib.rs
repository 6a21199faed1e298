pub mod action;
pub mod block;
pub mod custodian;
pub mod error;
pub mod instruction;
pub mod params;
pub mod request;
pub mod scratch;
pub mod state;

pub use action::{ActionRequest, PortalAction};
pub use block::Block;
pub use custodian::CustodianRecord;
pub use error::{PortalError, PortalResult};
pub use instruction::{Instruction, InstructionKind, InstructionStatus, PortalInstruction};
pub use params::PortalParams;
pub use scratch::{ScratchState, StateDiff};
pub use state::PortalState;
