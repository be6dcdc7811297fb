mod common;

use std::sync::Arc;
use std::time::Duration;

use storyforge_core::coherence::CoherenceSettings;
use storyforge_core::generation::ScriptedAdapter;
use storyforge_core::group::{
    GroupComparison, GroupCoordinator, GroupReport, GroupStatus, SiblingProfile, StartGroupRequest,
};
use storyforge_core::state::QualityProfile;
use storyforge_core::{ForgeConfig, SessionStatus, Stage};

use common::{eventually, runtime, test_config};

fn prompt_group(prompts: Vec<String>, auto_approve: bool) -> StartGroupRequest {
    StartGroupRequest {
        owner_id: "alice".into(),
        comparison: GroupComparison::Prompt {
            prompts,
            reference: None,
            profile: SiblingProfile::default(),
        },
        auto_approve,
    }
}

/// Wait until every member has stopped moving
async fn settled(groups: &GroupCoordinator, group_id: &str) -> GroupReport {
    eventually(move || async move {
        let report = groups.group_status(group_id).await.unwrap();
        let done = report.members.iter().all(|m| {
            matches!(
                m.status,
                SessionStatus::Complete | SessionStatus::Failed | SessionStatus::Expired
            )
        });
        done.then_some(report)
    })
    .await
}

#[tokio::test]
async fn test_settings_comparison_with_three_profiles() {
    let rt = runtime(Arc::new(ScriptedAdapter::new()), test_config());
    let profiles = vec![
        SiblingProfile {
            label: Some("seeded".into()),
            ..SiblingProfile::default()
        },
        SiblingProfile {
            label: Some("free".into()),
            coherence: CoherenceSettings::without_seed_control(),
            ..SiblingProfile::default()
        },
        SiblingProfile {
            label: Some("wide".into()),
            quality: QualityProfile {
                image_variants: Some(6),
                quality_threshold: Some(0.3),
                ..QualityProfile::default()
            },
            ..SiblingProfile::default()
        },
    ];
    let group = rt
        .groups
        .start_group(StartGroupRequest {
            owner_id: "alice".into(),
            comparison: GroupComparison::Settings {
                prompt: "a robot learns to paint".into(),
                reference: None,
                profiles,
            },
            auto_approve: true,
        })
        .await
        .unwrap();
    assert_eq!(group.labels, vec!["seeded", "free", "wide"]);

    let report = settled(&rt.groups, &group.id).await;
    assert_eq!(report.status, GroupStatus::Complete);
    assert!(report.error.is_none());
    for member in &report.members {
        assert_eq!(member.status, SessionStatus::Complete);
        assert_eq!(member.stage, Stage::Complete);
    }
    let total: f64 = report.members.iter().map(|m| m.cost).sum();
    assert!((report.aggregate_cost - total).abs() < 1e-9);

    let repo = rt.orchestrator.repository();
    let seeded = repo.load(&group.member_ids[0]).await.unwrap();
    let free = repo.load(&group.member_ids[1]).await.unwrap();
    let wide = repo.load(&group.member_ids[2]).await.unwrap();
    assert!(seeded.coherence.seed.is_some());
    assert!(free.coherence.seed.is_none());
    // six scored image variants cost more than the default four
    assert!(wide.cost > seeded.cost);
}

#[tokio::test]
async fn test_one_failing_sibling_never_touches_the_others() {
    for n in 2..=5usize {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.fail_when_prompt_contains("poisoned");
        let rt = runtime(adapter, test_config());

        let mut prompts: Vec<String> = (0..n).map(|i| format!("healthy tale {}", i)).collect();
        prompts[n / 2] = "a poisoned tale".to_string();
        let group = rt.groups.start_group(prompt_group(prompts, true)).await.unwrap();

        let report = settled(&rt.groups, &group.id).await;
        let failed: Vec<_> = report
            .members
            .iter()
            .filter(|m| m.status == SessionStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1, "group of {}", n);
        assert_eq!(failed[0].session_id, group.member_ids[n / 2]);
        assert_eq!(failed[0].error.as_ref().unwrap().code, "upstream_generation_error");
        assert_eq!(
            report
                .members
                .iter()
                .filter(|m| m.status == SessionStatus::Complete)
                .count(),
            n - 1
        );

        assert_eq!(report.status, GroupStatus::Mixed);
        let error = report.error.unwrap();
        assert_eq!(error.code, "partial_group_failure");
    }
}

#[tokio::test]
async fn test_all_siblings_start_together() {
    let adapter = Arc::new(ScriptedAdapter::new());
    adapter.set_delay(Duration::from_millis(300));
    let rt = runtime(adapter, test_config());

    let prompts = (0..5).map(|i| format!("parallel tale {}", i)).collect();
    let group = rt.groups.start_group(prompt_group(prompts, false)).await.unwrap();

    // every sibling is generating before the first story stage can finish
    let groups = &rt.groups;
    let group_id = group.id.as_str();
    let report = eventually(move || async move {
        let report = groups.group_status(group_id).await.unwrap();
        report
            .members
            .iter()
            .all(|m| m.status == SessionStatus::Running)
            .then_some(report)
    })
    .await;
    assert_eq!(report.members.len(), 5);
    assert_eq!(report.status, GroupStatus::Running);
}

#[tokio::test]
async fn test_manual_group_member_pauses_on_upstream_failure() {
    let adapter = Arc::new(ScriptedAdapter::new());
    adapter.fail_when_prompt_contains("stormy");
    let rt = runtime(adapter, test_config());

    let group = rt
        .groups
        .start_group(prompt_group(vec!["a stormy night".into(), "a calm day".into()], false))
        .await
        .unwrap();

    let groups = &rt.groups;
    let group_id = group.id.as_str();
    let report = eventually(move || async move {
        let report = groups.group_status(group_id).await.unwrap();
        report
            .members
            .iter()
            .all(|m| m.status == SessionStatus::Paused)
            .then_some(report)
    })
    .await;

    let stormy = &report.members[0];
    assert_eq!(stormy.stage, Stage::Story);
    let error = stormy.error.as_ref().unwrap();
    assert_eq!(error.code, "upstream_generation_error");
    assert!(error.recoverable);

    let calm = &report.members[1];
    assert!(calm.error.is_none());
    assert_eq!(report.status, GroupStatus::Running);
    assert!(report.error.is_none());

    // still open to a human regenerate
    let session = rt
        .orchestrator
        .regenerate(&stormy.session_id, "try a gentler storm")
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Running);
}

#[tokio::test]
async fn test_every_sibling_failing_fails_the_group() {
    let adapter = Arc::new(ScriptedAdapter::new());
    adapter.fail_when_prompt_contains("doomed");
    let rt = runtime(adapter, test_config());

    let group = rt
        .groups
        .start_group(prompt_group(vec!["doomed one".into(), "doomed two".into()], true))
        .await
        .unwrap();
    let report = settled(&rt.groups, &group.id).await;
    assert_eq!(report.status, GroupStatus::Failed);
}

#[tokio::test]
async fn test_quota_checked_once_for_the_whole_group() {
    let mut config = test_config();
    config.quota.units_per_window = 4;
    let rt = runtime(Arc::new(ScriptedAdapter::new()), config);

    let prompts = |tag: &str, n: usize| (0..n).map(|i| format!("{} {}", tag, i)).collect();
    rt.groups
        .start_group(prompt_group(prompts("first", 3), false))
        .await
        .unwrap();
    assert_eq!(rt.quota.remaining("alice").await, 1);

    let err = rt
        .groups
        .start_group(prompt_group(prompts("second", 2), false))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "quota_exceeded");
    assert_eq!(rt.quota.remaining("alice").await, 1);
}

#[tokio::test]
async fn test_cancel_fails_only_pending_siblings() {
    let adapter = Arc::new(ScriptedAdapter::new());
    adapter.set_delay(Duration::from_millis(150));
    let mut config: ForgeConfig = test_config();
    config.groups.max_concurrent_siblings = Some(1);
    let rt = runtime(adapter, config);

    let prompts = (0..3).map(|i| format!("tale {}", i)).collect();
    let group = rt.groups.start_group(prompt_group(prompts, false)).await.unwrap();

    let groups = &rt.groups;
    let group_id = group.id.as_str();
    let running = eventually(move || async move {
        let report = groups.group_status(group_id).await.unwrap();
        report
            .members
            .iter()
            .find(|m| m.status == SessionStatus::Running)
            .map(|m| m.session_id.clone())
    })
    .await;

    let report = rt.groups.cancel_group(&group.id).await.unwrap();
    for member in &report.members {
        if member.session_id == running {
            assert_eq!(member.status, SessionStatus::Running);
        } else {
            assert_eq!(member.status, SessionStatus::Failed);
            assert_eq!(member.error.as_ref().unwrap().code, "cancelled");
        }
    }

    // the running sibling is left to reach its checkpoint
    let repo = rt.orchestrator.repository();
    let running_id = running.as_str();
    let paused = eventually(move || async move {
        let session = repo.load(running_id).await.unwrap();
        (session.status == SessionStatus::Paused).then_some(session)
    })
    .await;
    assert_eq!(paused.stage, Stage::Story);

    let again = rt.groups.cancel_group(&group.id).await.unwrap();
    assert_eq!(again.status, GroupStatus::Mixed);
    assert_eq!(
        again
            .members
            .iter()
            .filter(|m| m.status == SessionStatus::Failed)
            .count(),
        2
    );
}
