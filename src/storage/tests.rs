use super::*;

/// Shared fixture for storage tests: a real SQLite database in a temp
/// directory, removed when the harness drops.
pub(crate) struct TestHarness {
    pub db: Db,
    _dir: tempfile::TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let suffix: u16 = rand::random();
        let path = dir.path().join(format!("kedge_test_{suffix}.db"));
        let db = Db::new(&path).await.expect("open test database");

        Self { db, _dir: dir }
    }
}
