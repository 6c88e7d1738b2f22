pub mod loader;
pub mod model;

pub use loader::{parse_document, ConfigLoader, DEFAULT_NOTIFY};
pub use model::{
    AggregateDef, ConfigDocument, EngineSettings, ExecDef, MatchMode, MonitorDef, NotifyActionDef,
    NotifyActionTable, NotifyDef, OneOrMany, PushBulletDef, SmtpDef,
};
