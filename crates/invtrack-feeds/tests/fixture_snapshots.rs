use std::path::Path;

use invtrack_feeds::{FixtureSource, SnapshotSource};

#[tokio::test]
async fn every_checked_in_fixture_normalizes() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
    for source in ["comex", "lme", "shfe"] {
        let path = root.join(source).join("sample/snapshot.json");
        assert!(path.exists(), "missing fixture {}", path.display());

        let snapshot = FixtureSource::new(&path).fetch_snapshot().await.unwrap();
        let record = snapshot.to_record().unwrap();
        assert_eq!(record.source_id.to_ascii_lowercase(), source);
        assert!(record.total_value().is_some(), "{source} fixture has no total");
    }
}
