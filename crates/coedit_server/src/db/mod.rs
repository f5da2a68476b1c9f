mod repo;
mod schema;

pub use repo::{
    AppendedOperation, AuthRepo, DocumentInfo, DocumentRepo, OperationRecord, Role, SessionInfo,
    UserInfo, derive_operation_id,
};
pub use schema::init_database;
