pub mod changes;
pub mod label;
pub mod monorepo;
pub mod owners;
pub mod pathexpr;
pub mod policy;
pub mod registry;
pub mod textfile;
pub mod units;

pub use changes::{ChangedFile, Changelist, FileStatus};
pub use label::{Label, TargetExpression};
pub use monorepo::{Monorepo, SubRepo, WORKSPACE_FILE};
pub use pathexpr::{ExpressionSet, PathExpression, ReplacementExpression};
pub use policy::{CheckDecl, PresubmitPolicy, POLICY_FILE, POLICY_FILE_EXT};
pub use registry::UnitRegistry;
pub use units::{
    BuildTestUnit, BuildUnit, CronUnit, Notify, NotifyPolicy, PostSubmit, PublishUnit, TaskUnit,
    TestSuite, TestUnit, Unit, UnitCatalog, UNIT_FILE, UNIT_FILE_EXT,
};
