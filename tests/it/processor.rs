//! Repository-pass behavior: the snoop fast path and ref bookkeeping.

use arcyd::config::RepoDescriptor;
use arcyd::processor::{RepoProcessor, RepoSummary};
use url::Url;

use crate::helper::{FakePhabricator, Fixture, SequenceProbe};

const MAX_DIFF: u64 = 1024 * 1024;

fn descriptor_with_snoop(fixture: &Fixture) -> RepoDescriptor {
    RepoDescriptor::new(
        "widgets".to_owned(),
        "The Widgets Repo".to_owned(),
        fixture.work.clone(),
        fixture.origin.to_str().expect("path").to_owned(),
        "origin".to_owned(),
        "phab".to_owned(),
        Vec::new(),
        Some(Url::parse("http://example.com/widgets/info/refs").expect("url")),
    )
}

#[test]
fn unchanged_snoop_url_skips_the_fetch() {
    let fixture = Fixture::new();
    let fake = FakePhabricator::new();
    // Same digest forever: the first probe observes it, later probes match.
    let services =
        crate::helper::services_around(&fake, Box::new(SequenceProbe::new(vec!["constant"])));
    let mut processor = RepoProcessor::new(
        descriptor_with_snoop(&fixture),
        services,
        MAX_DIFF,
        fixture.watcher_path(),
    );

    // First pass: no prior observation, so the repo is processed.
    let first = processor.process(false).expect("pass must succeed");
    assert!(matches!(first, RepoSummary::Processed(_)));

    // Second pass: the snoop URL did not change, so the fetch is skipped.
    let second = processor.process(false).expect("pass must succeed");
    assert_eq!(second, RepoSummary::Skipped);

    // Forcing bypasses the fast path.
    let forced = processor.process(true).expect("pass must succeed");
    assert!(matches!(forced, RepoSummary::Processed(_)));
}

#[test]
fn changed_snoop_url_triggers_processing() {
    let fixture = Fixture::new();
    let fake = FakePhabricator::new();
    let services = crate::helper::services_around(
        &fake,
        Box::new(SequenceProbe::new(vec!["one", "two", "two"])),
    );
    let mut processor = RepoProcessor::new(
        descriptor_with_snoop(&fixture),
        services,
        MAX_DIFF,
        fixture.watcher_path(),
    );

    assert!(matches!(
        processor.process(false).expect("pass"),
        RepoSummary::Processed(_)
    ));
    // Digest changed from "one" to "two": processed again.
    assert!(matches!(
        processor.process(false).expect("pass"),
        RepoSummary::Processed(_)
    ));
    // Digest stable at "two": skipped.
    assert_eq!(processor.process(false).expect("pass"), RepoSummary::Skipped);
}

#[test]
fn watcher_state_is_persisted_between_passes() {
    let fixture = Fixture::new();
    let fake = FakePhabricator::new();
    let services =
        crate::helper::services_around(&fake, Box::new(SequenceProbe::new(vec!["constant"])));
    let mut processor = RepoProcessor::new(
        descriptor_with_snoop(&fixture),
        services,
        MAX_DIFF,
        fixture.watcher_path(),
    );

    let _ = processor.process(false).expect("pass must succeed");
    let persisted = std::fs::read_to_string(fixture.watcher_path())
        .expect("watcher state must be persisted");
    assert!(persisted.contains("http://example.com/widgets/info/refs"));
}

#[test]
fn pass_without_managed_branches_changes_nothing() {
    let fixture = Fixture::new();
    let fake = FakePhabricator::new();
    let services =
        crate::helper::services_around(&fake, Box::new(SequenceProbe::new(vec!["x"])));
    let mut processor = RepoProcessor::new(
        fixture.descriptor(),
        services,
        MAX_DIFF,
        fixture.watcher_path(),
    );

    let summary = processor.process(false).expect("pass must succeed");
    assert_eq!(summary, RepoSummary::Processed(Vec::new()));
    assert_eq!(fake.review_count(), 0);
    assert_eq!(fixture.origin_branches(), vec!["master".to_owned()]);
}
