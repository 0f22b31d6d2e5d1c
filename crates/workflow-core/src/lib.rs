pub mod config;
pub mod events;
pub mod frontmatter;
pub mod graph;
pub mod ids;
pub mod pipeline;
pub mod types;

pub use config::DaemonConfig;
pub use events::EventPayload;
pub use graph::{find_cycles, Cycle};
pub use ids::{DepRef, Id, IdError, IdKind};
pub use pipeline::{PipelineConfig, PipelineConfigError, PipelineModel};
pub use types::{
    Dependency, EntityKind, Epic, KanbanColumn, MrCommentTracking, ParentBranchTracking,
    PendingMergeParent, Repo, ReservedStatus, Stage, StageStatus, Ticket, TicketSource,
};
