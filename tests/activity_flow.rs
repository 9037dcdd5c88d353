//! End-to-end activity flow on the simulated control core

use rccnet::{
    parse, ActivityHandle, ActivityResult, ActivitySchedule, Command, CommandResult, CoreConfig, NetCommand,
    NetStatus, ResultStatus, RuleStatus, RuntimeResult, RuntimeSchedule, ScheduleStatus, SimulatedCore,
};
use std::sync::Arc;
use std::time::Duration;

const MOVE: &str =
    "{target=Core::DoubleValue(Value='1.5'),out=Core::DoubleNetcommOut(inValue=target.outValue,Key='target'),outTarget=target.outValue}";

struct Activity {
    command: Arc<dyn Command>,
    schedule: RuntimeSchedule,
    completion: RuntimeResult,
}

fn core() -> Arc<SimulatedCore> {
    Arc::new(SimulatedCore::new(&CoreConfig::default()).unwrap())
}

fn activity(name: &str, device: &str, core: &Arc<SimulatedCore>, predecessor: RuntimeResult) -> Activity {
    let command: Arc<dyn Command> = Arc::new(NetCommand::new(
        name,
        parse(MOVE).unwrap(),
        core.clone(),
        &CoreConfig::default(),
    ));
    let completion = RuntimeResult::completion(CommandResult::completions(&command), &[device]);
    let schedule = RuntimeSchedule::builder(name, core.clone())
        .command(command.clone())
        .predecessor(predecessor)
        .result(completion.clone())
        .result(RuntimeResult::cancellation(CommandResult::cancellations(&command), &[device]))
        .result(RuntimeResult::failure("move failed", CommandResult::exceptions(&command), &[device]))
        .build();
    Activity {
        command,
        schedule,
        completion,
    }
}

fn net_of(activity: &Activity) -> rccnet::NetId {
    activity.command.handle().unwrap().id()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn test_single_activity_completes() {
    let core = core();
    let first = activity("move", "arm", &core, RuntimeResult::fresh(&["arm"]));

    first.schedule.load().await.unwrap();
    assert_eq!(first.schedule.status(), ScheduleStatus::Loaded);
    assert_eq!(first.completion.status(), ResultStatus::Possible);

    assert!(first.schedule.activate().await.unwrap());
    core.flush().await.unwrap();
    assert_eq!(first.schedule.status(), ScheduleStatus::Active);
    assert_eq!(first.command.handle().unwrap().status(), NetStatus::Running);

    core.finish(net_of(&first)).await.unwrap();
    assert_eq!(first.schedule.wait_terminal().await, ScheduleStatus::Complete);
    assert_eq!(first.completion.status(), ResultStatus::Active);
    assert!(first.completion.is_completed());

    first.schedule.unload().await.unwrap();
    assert!(core.loaded_nets().is_empty());
}

#[tokio::test]
async fn test_chained_activity_starts_after_predecessor() {
    let core = core();
    let first = activity("approach", "arm", &core, RuntimeResult::fresh(&["arm"]));
    let second = activity("retreat", "arm", &core, first.completion.clone());

    first.schedule.load().await.unwrap();
    second.schedule.load().await.unwrap();
    assert!(first.schedule.activate().await.unwrap());
    assert!(second.schedule.activate().await.unwrap());
    core.flush().await.unwrap();

    assert_eq!(second.schedule.status(), ScheduleStatus::Loaded);
    assert_eq!(second.command.handle().unwrap().status(), NetStatus::Scheduled);

    core.finish(net_of(&first)).await.unwrap();
    assert_eq!(first.schedule.wait_terminal().await, ScheduleStatus::Complete);
    assert!(eventually(|| second.schedule.status() == ScheduleStatus::Active).await);
    assert_eq!(second.command.handle().unwrap().status(), NetStatus::Running);
    assert_eq!(second.schedule.rule().unwrap().status(), RuleStatus::Fired);

    core.finish(net_of(&second)).await.unwrap();
    assert_eq!(second.schedule.wait_terminal().await, ScheduleStatus::Complete);
}

#[tokio::test]
async fn test_failed_predecessor_makes_successor_impossible() {
    let core = core();
    let first = activity("approach", "arm", &core, RuntimeResult::fresh(&["arm"]));
    let second = activity("retreat", "arm", &core, first.completion.clone());

    first.schedule.load().await.unwrap();
    second.schedule.load().await.unwrap();
    first.schedule.activate().await.unwrap();
    second.schedule.activate().await.unwrap();
    core.flush().await.unwrap();

    core.fail(net_of(&first), "joint limit").await.unwrap();
    assert_eq!(first.schedule.wait_terminal().await, ScheduleStatus::Failed);
    assert_eq!(first.completion.status(), ResultStatus::Impossible);
    assert_eq!(second.schedule.wait_terminal().await, ScheduleStatus::Impossible);
    assert!(!second.schedule.is_taken());
    assert!(eventually(|| first.schedule.is_unloaded() && second.schedule.is_unloaded()).await);
}

#[tokio::test]
async fn test_cancel_running_activity() {
    let core = core();
    let first = activity("move", "arm", &core, RuntimeResult::fresh(&["arm"]));
    let handle = ActivityHandle::new();
    first.schedule.attach_handle(&handle);

    first.schedule.load().await.unwrap();
    first.schedule.activate().await.unwrap();
    core.flush().await.unwrap();
    assert_eq!(handle.status(), ScheduleStatus::Active);

    first.schedule.cancel().await;
    assert_eq!(first.schedule.wait_terminal().await, ScheduleStatus::Cancelled);
    assert_eq!(handle.wait_terminal().await, ScheduleStatus::Cancelled);
    assert_eq!(first.completion.status(), ResultStatus::Impossible);
}

#[tokio::test]
async fn test_parallel_activities_start_together() {
    let core = core();
    let arm = activity("arm", "arm", &core, RuntimeResult::fresh(&["arm"]));
    let gripper = activity("gripper", "gripper", &core, RuntimeResult::fresh(&["gripper"]));
    let both = arm.schedule.with_parallel(&gripper.schedule).unwrap();
    assert_eq!(both.results().len(), 9);

    both.load().await.unwrap();
    assert!(both.activate().await.unwrap());
    core.flush().await.unwrap();
    assert_eq!(both.status(), ScheduleStatus::Active);
    assert_eq!(arm.schedule.status(), ScheduleStatus::Active);
    assert_eq!(gripper.schedule.status(), ScheduleStatus::Active);
    assert!(arm.schedule.is_taken() && gripper.schedule.is_taken());

    core.finish(net_of(&arm)).await.unwrap();
    core.flush().await.unwrap();
    assert_eq!(both.status(), ScheduleStatus::Active);

    core.finish(net_of(&gripper)).await.unwrap();
    assert_eq!(both.wait_terminal().await, ScheduleStatus::Complete);
    assert_eq!(arm.schedule.status(), ScheduleStatus::Complete);
    assert_eq!(gripper.schedule.status(), ScheduleStatus::Complete);
}

#[tokio::test]
async fn test_refused_activation() {
    let core = core();
    let first = activity("move", "arm", &core, RuntimeResult::fresh(&["arm"]));
    first.schedule.load().await.unwrap();
    core.refuse_schedules(true);

    assert!(!first.schedule.activate().await.unwrap());
    assert_eq!(first.schedule.status(), ScheduleStatus::Impossible);
    assert!(eventually(|| core.loaded_nets().is_empty()).await);
    assert!(first.schedule.is_unloaded());
}
