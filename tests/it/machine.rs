//! End-to-end branch lifecycle scenarios: create, update, land, conflict,
//! abandon.

use std::sync::Arc;

use arcyd::api::review::ReviewStatus;
use arcyd::branch::machine::BranchOutcome;
use arcyd::branch::name::TrackerStatus;
use arcyd::processor::{RepoProcessor, RepoSummary};
use arcyd::services::Services;

use crate::helper::{git, FakePhabricator, Fixture, SequenceProbe};

const MESSAGE: &str = "Title\n\nTest Plan: x\nReviewers: alice";
const MAX_DIFF: u64 = 1024 * 1024;

fn setup(fixture: &Fixture) -> (Arc<FakePhabricator>, Services, RepoProcessor) {
    let fake = FakePhabricator::new();
    let services = crate::helper::services_around(&fake, Box::new(SequenceProbe::new(vec!["x"])));
    let processor = RepoProcessor::new(
        fixture.descriptor(),
        services.clone(),
        MAX_DIFF,
        fixture.watcher_path(),
    );
    (fake, services, processor)
}

/// What the engine's refresh-caches operation does between cycles.
fn refresh(services: &Services) {
    services
        .review_states()
        .refresh_active()
        .expect("refresh must succeed");
}

fn outcomes(summary: RepoSummary) -> Vec<(String, BranchOutcome)> {
    match summary {
        RepoSummary::Processed(outcomes) => outcomes,
        RepoSummary::Skipped => panic!("pass must not be skipped"),
    }
}

#[test]
fn create_review_from_fresh_branch() {
    let fixture = Fixture::new();
    fixture.push_review_branch("r/master/feature-1", "feature.txt", "feature\n", MESSAGE);

    let (fake, _services, mut processor) = setup(&fixture);

    let results = outcomes(processor.process(false).expect("pass must succeed"));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1, BranchOutcome::Created(1));

    let review = fake.review(1);
    assert_eq!(review.title, "Title");
    assert_eq!(review.test_plan, "x");
    assert_eq!(review.reviewers, vec!["alice"]);
    assert_eq!(review.status, ReviewStatus::NeedsReview);

    let branches = fixture.origin_branches();
    assert!(
        branches.contains(&"dev/arcyd/ok_new/feature-1/master/1".to_owned()),
        "tracker must be published, saw: {branches:?}"
    );
}

#[test]
fn update_review_when_tip_moves() {
    let fixture = Fixture::new();
    fixture.push_review_branch("r/master/feature-1", "feature.txt", "feature\n", MESSAGE);

    let (fake, services, mut processor) = setup(&fixture);
    let _ = processor.process(false).expect("pass must succeed");
    refresh(&services);

    // A second commit on the same branch.
    std::fs::write(fixture.seed.join("feature.txt"), "feature v2\n").expect("must write");
    git(&fixture.seed, &["add", "feature.txt"]);
    git(&fixture.seed, &["commit", "--quiet", "-m", "more work"]);
    git(&fixture.seed, &["push", "--quiet", "origin", "r/master/feature-1"]);

    let results = outcomes(processor.process(false).expect("pass must succeed"));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1, BranchOutcome::Updated(1));

    // No second review was created; the diff was refreshed once.
    assert_eq!(fake.review_count(), 1);
    assert_eq!(fake.review(1).diff_updates, 1);

    // The tracker moved to plain `ok` and the old name is gone.
    let branches = fixture.origin_branches();
    assert!(branches.contains(&"dev/arcyd/ok/feature-1/master/1".to_owned()));
    assert!(!branches.contains(&"dev/arcyd/ok_new/feature-1/master/1".to_owned()));
}

#[test]
fn land_accepted_review() {
    let fixture = Fixture::new();
    fixture.push_review_branch("r/master/feature-1", "feature.txt", "feature\n", MESSAGE);

    let (fake, services, mut processor) = setup(&fixture);
    let _ = processor.process(false).expect("pass must succeed");

    fake.set_status(1, ReviewStatus::Accepted);
    refresh(&services);
    let results = outcomes(processor.process(false).expect("pass must succeed"));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1, BranchOutcome::Landed(1));

    // The base carries the squash commit; the review branch is gone.
    let master = fixture.origin_first_parent_messages("master");
    assert!(master[0].starts_with("Title"));
    assert!(master[0].contains("Reviewed-by: alice"));
    let branches = fixture.origin_branches();
    assert!(!branches.contains(&"r/master/feature-1".to_owned()));
    assert!(branches.contains(&"dev/arcyd/landed/feature-1/master/1".to_owned()));

    // The landed archive gained exactly one first-parent entry.
    assert!(fixture.origin_has_ref("refs/arcyd/landed"));
    let archive = fixture.origin_first_parent_messages("refs/arcyd/landed");
    assert_eq!(archive.len(), 2, "one landing entry plus the initial commit");
    assert!(archive[0].starts_with("landed r/master/feature-1 on master as "));
    assert!(archive[0].contains("with message:\nTitle"));
    assert!(archive[1].starts_with("Create an archive branch for landed branches"));

    // A subsequent pass must not touch anything (landed is terminal).
    refresh(&services);
    let results = outcomes(processor.process(false).expect("pass must succeed"));
    assert!(results.is_empty());
}

#[test]
fn archive_history_is_append_only() {
    let fixture = Fixture::new();
    let (fake, services, mut processor) = setup(&fixture);

    fixture.push_review_branch("r/master/feature-1", "one.txt", "feature one\n", MESSAGE);
    let _ = processor.process(false).expect("pass must succeed");
    fake.set_status(1, ReviewStatus::Accepted);
    refresh(&services);
    let _ = processor.process(false).expect("pass must succeed");

    fixture.push_review_branch("r/master/feature-2", "two.txt", "feature two\n", MESSAGE);
    refresh(&services);
    let _ = processor.process(false).expect("pass must succeed");
    fake.set_status(2, ReviewStatus::Accepted);
    refresh(&services);
    let _ = processor.process(false).expect("pass must succeed");

    let archive = fixture.origin_first_parent_messages("refs/arcyd/landed");
    assert_eq!(archive.len(), 3, "two landings plus the initial commit");
    assert!(archive[0].starts_with("landed r/master/feature-2 on master as "));
    assert!(archive[1].starts_with("landed r/master/feature-1 on master as "));
}

#[test]
fn conflicting_land_marks_bad_and_comments() {
    let fixture = Fixture::new();
    fixture.push_review_branch("r/master/feature-1", "data.txt", "feature\n", MESSAGE);

    let (fake, services, mut processor) = setup(&fixture);
    let _ = processor.process(false).expect("pass must succeed");

    // A conflicting commit lands on master behind arcyd's back.
    git(&fixture.seed, &["checkout", "--quiet", "master"]);
    std::fs::write(fixture.seed.join("data.txt"), "conflict\n").expect("must write");
    git(&fixture.seed, &["add", "data.txt"]);
    git(&fixture.seed, &["commit", "--quiet", "-m", "conflicting change"]);
    git(&fixture.seed, &["push", "--quiet", "origin", "master"]);
    let master_before = crate::helper::git_output(&fixture.origin, &["rev-parse", "master"]);

    fake.set_status(1, ReviewStatus::Accepted);
    refresh(&services);
    let results = outcomes(processor.process(false).expect("pass must succeed"));
    assert_eq!(
        results[0].1,
        BranchOutcome::MarkedBad {
            review_id: Some(1),
            status: TrackerStatus::BadLand,
        }
    );

    // Master is untouched and the review was told why.
    let master_after = crate::helper::git_output(&fixture.origin, &["rev-parse", "master"]);
    assert_eq!(master_before, master_after);
    let branches = fixture.origin_branches();
    assert!(branches.contains(&"dev/arcyd/bad_land/feature-1/master/1".to_owned()));
    assert!(branches.contains(&"r/master/feature-1".to_owned()));
    let review = fake.review(1);
    assert_eq!(review.comments.len(), 1);
    assert!(review.comments[0].contains("could not land"));

    // The landing is not retried while the branch tip is unchanged, even
    // though the review is still accepted: no second comment, no new landing
    // attempt against the base.
    refresh(&services);
    let results = outcomes(processor.process(false).expect("pass must succeed"));
    assert!(results.is_empty());
    let master_later = crate::helper::git_output(&fixture.origin, &["rev-parse", "master"]);
    assert_eq!(master_before, master_later);
    assert_eq!(fake.review(1).comments.len(), 1);
}

#[test]
fn deleted_branch_is_abandoned() {
    let fixture = Fixture::new();
    fixture.push_review_branch("r/master/feature-1", "feature.txt", "feature\n", MESSAGE);

    let (fake, services, mut processor) = setup(&fixture);
    let _ = processor.process(false).expect("pass must succeed");
    refresh(&services);

    // The author deletes the branch while the review is open.
    git(&fixture.seed, &["push", "--quiet", "origin", ":r/master/feature-1"]);

    let results = outcomes(processor.process(false).expect("pass must succeed"));
    assert_eq!(results[0].1, BranchOutcome::Abandoned(Some(1)));

    let review = fake.review(1);
    assert_eq!(review.status, ReviewStatus::Abandoned);
    assert!(review.comments.iter().any(|c| c.contains("deleted")));

    // The abandoned archive grew and the tracker is gone.
    assert!(fixture.origin_has_ref("refs/arcyd/abandoned"));
    let archive = fixture.origin_first_parent_messages("refs/arcyd/abandoned");
    assert_eq!(archive.len(), 2);
    assert!(archive[0].starts_with("abandoned r/master/feature-1 on master as "));
    let branches = fixture.origin_branches();
    assert!(!branches.iter().any(|branch| branch.starts_with("dev/arcyd/")));
}

#[test]
fn unknown_reviewer_marks_branch_bad_without_review() {
    let fixture = Fixture::new();
    fixture.push_review_branch(
        "r/master/feature-1",
        "feature.txt",
        "feature\n",
        "Title\n\nTest Plan: x\nReviewers: ghost",
    );

    let (fake, _services, mut processor) = setup(&fixture);

    let results = outcomes(processor.process(false).expect("pass must succeed"));
    assert_eq!(
        results[0].1,
        BranchOutcome::MarkedBad {
            review_id: None,
            status: TrackerStatus::BadInReview,
        }
    );
    assert_eq!(fake.review_count(), 0);

    let branches = fixture.origin_branches();
    assert!(branches.contains(&"dev/arcyd/bad_inreview/feature-1/master/none".to_owned()));

    // An unchanged tip stays bad on the next pass; no churn.
    let results = outcomes(processor.process(false).expect("pass must succeed"));
    assert!(results.is_empty());
}

#[test]
fn bad_branch_recovers_when_fixed() {
    let fixture = Fixture::new();
    fixture.push_review_branch(
        "r/master/feature-1",
        "feature.txt",
        "feature\n",
        "Title\n\nno fields here at all",
    );

    let (fake, _services, mut processor) = setup(&fixture);
    let results = outcomes(processor.process(false).expect("pass must succeed"));
    assert!(matches!(results[0].1, BranchOutcome::MarkedBad { .. }));

    // The author amends with a proper message and force-pushes.
    git(&fixture.seed, &["checkout", "--quiet", "r/master/feature-1"]);
    git(&fixture.seed, &["commit", "--quiet", "--amend", "-m", MESSAGE]);
    git(&fixture.seed, &[
        "push",
        "--quiet",
        "--force",
        "origin",
        "r/master/feature-1",
    ]);

    let results = outcomes(processor.process(false).expect("pass must succeed"));
    assert_eq!(results[0].1, BranchOutcome::Created(1));
    assert_eq!(fake.review_count(), 1);
    let branches = fixture.origin_branches();
    assert!(branches.contains(&"dev/arcyd/ok_new/feature-1/master/1".to_owned()));
    assert!(!branches.contains(&"dev/arcyd/bad_inreview/feature-1/master/none".to_owned()));
}
