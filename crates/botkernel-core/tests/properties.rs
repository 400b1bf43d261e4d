use botkernel_core::config::TasksConfig;
use botkernel_core::kernel::AckOutcome;
use botkernel_core::state::{ActionSpec, DecomposeError, Decomposition, TaskId, TaskSpec, TaskStatus};
use botkernel_core::{
    Action, ActionKind, ActionPayload, ActionQueue, ActionStatus, Context, TaskManager,
};
use proptest::prelude::*;
use serde_json::Value;

fn wait() -> ActionPayload {
    ActionPayload::new(ActionKind::Wait)
}

fn one_wait(_: &Context, plan: &mut Decomposition) -> Result<(), DecomposeError> {
    plan.action(ActionSpec::new(wait()));
    Ok(())
}

fn node(i: usize) -> TaskId {
    TaskId::new(format!("t{i}"))
}

fn step(ctx: &mut Context, tasks: &mut TaskManager, queue: &mut ActionQueue) {
    ctx.advance();
    tasks.tick(ctx, queue);
    tasks.absorb(queue);
}

proptest! {
    #[test]
    fn dequeue_is_priority_then_fifo(priorities in prop::collection::vec(0i32..4, 1..24)) {
        let mut queue = ActionQueue::default();
        for (i, priority) in priorities.iter().enumerate() {
            queue.enqueue(Action::new(format!("a{i}"), *priority, wait()), 0).unwrap();
        }

        let order: Vec<(i32, usize)> = std::iter::from_fn(|| queue.dequeue_ready(0))
            .map(|a| {
                let index = a.id.as_str()[1..].parse::<usize>().unwrap();
                (a.priority, index)
            })
            .collect();

        prop_assert_eq!(order.len(), priorities.len());
        for pair in order.windows(2) {
            let ((p1, i1), (p2, i2)) = (pair[0], pair[1]);
            prop_assert!(p1 > p2 || (p1 == p2 && i1 < i2), "{:?} before {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn exhausted_actions_stay_failed(max_attempts in 1u32..6) {
        let mut queue = ActionQueue::default();
        let id = "flaky".into();
        queue
            .enqueue(Action::new("flaky", 0, wait()).with_max_attempts(max_attempts), 0)
            .unwrap();

        let mut now = 0;
        let mut failures = 0;
        while failures < max_attempts {
            if queue.dequeue_ready(now).is_some() {
                queue.ack_failure(&id, "timeout", now).unwrap();
                failures += 1;
            }
            now += 1;
            prop_assert!(now < 1_000, "retry never became ready");
        }

        let action = queue.get(&id).unwrap();
        prop_assert_eq!(action.status, ActionStatus::Failed);
        prop_assert_eq!(action.attempts, max_attempts);
        prop_assert!(!queue.is_live(&id));
        prop_assert!(queue.dequeue_ready(now + 1_000).is_none());
        prop_assert_eq!(
            queue.ack_success(&id, Value::Null, now).unwrap(),
            AckOutcome::AlreadySettled(ActionStatus::Failed)
        );
    }

    #[test]
    fn cancelling_a_root_leaves_nothing_live(
        parents in prop::collection::vec(any::<prop::sample::Index>(), 0..10),
        warmup in 0usize..5,
    ) {
        let mut ctx = Context::default();
        let mut queue = ActionQueue::default();
        let mut tasks = TaskManager::new(TasksConfig::default());

        tasks.submit(TaskSpec::new(node(0), one_wait), ctx.now()).unwrap();
        for (i, parent) in parents.iter().enumerate() {
            let parent = node(parent.index(i + 1));
            tasks
                .submit(TaskSpec::new(node(i + 1), one_wait).child_of(parent), ctx.now())
                .unwrap();
        }

        for _ in 0..warmup {
            step(&mut ctx, &mut tasks, &mut queue);
            queue.dequeue_ready(ctx.now());
        }

        tasks.cancel(&node(0), ctx.now(), &mut queue).unwrap();
        tasks.absorb(&mut queue);

        for task in tasks.tasks() {
            prop_assert!(task.is_finished(), "{} left {:?}", task.id, task.status);
            for (action, _) in task.actions() {
                prop_assert!(!queue.is_live(action), "{} still live", action);
            }
        }
        prop_assert!(queue.is_empty());
    }

    #[test]
    fn running_tasks_have_completed_dependencies(
        edges in prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..3), 1..8),
        acks in prop::collection::vec(any::<bool>(), 0..40),
    ) {
        let mut ctx = Context::default();
        let mut queue = ActionQueue::default();
        let mut tasks = TaskManager::new(TasksConfig::default());

        for (i, deps) in edges.iter().enumerate() {
            let mut spec = TaskSpec::new(node(i), one_wait);
            if i > 0 {
                for dep in deps {
                    let dep = node(dep.index(i));
                    if !spec.dependencies.contains(&dep) {
                        spec = spec.depends_on(dep);
                    }
                }
            }
            tasks.submit(spec, ctx.now()).unwrap();
        }

        let mut acks = acks.into_iter();
        for _ in 0..60 {
            step(&mut ctx, &mut tasks, &mut queue);
            if let Some(action) = queue.dequeue_ready(ctx.now()) {
                if acks.next().unwrap_or(true) {
                    queue.ack_success(&action.id, Value::Null, ctx.now()).unwrap();
                } else {
                    queue.fail_permanently(&action.id, "rejected", ctx.now()).unwrap();
                }
            }

            for task in tasks.tasks().filter(|t| t.status == TaskStatus::Running) {
                for dep in &task.dependencies {
                    prop_assert_eq!(
                        tasks.status(dep),
                        Some(TaskStatus::Completed),
                        "{} running before {}",
                        task.id,
                        dep
                    );
                }
            }
        }
    }
}
