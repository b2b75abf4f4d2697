//! Performance benchmarks for the input dispatcher
//!
//! These benchmarks drive the dispatcher through real channel pairs on a
//! manual clock, so they measure routing and queueing without any sleeping.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use input_dispatcher::input::{keycodes, InputSource, KeyAction, MotionAction, PointerCoords, PointerProperties};
use input_dispatcher::window::{Rectangle, WindowFlags};
use input_dispatcher::{
    open_pair, Clock, DefaultDispatcherPolicy, DispatcherConfig, InputConsumer, InputDispatcher, InputWindow,
    ManualClock, Nsecs, NotifyKeyArgs, NotifyMotionArgs, WindowHandle,
};
use std::sync::Arc;

const START_TIME: Nsecs = 1_000_000_000_000;

struct Bench {
    dispatcher: Arc<InputDispatcher>,
    clock: Arc<ManualClock>,
    consumers: Vec<InputConsumer>,
}

impl Bench {
    /// A dispatcher with `window_count` side by side windows, 10px wide each.
    /// The first one has focus.
    fn new(window_count: i32) -> Self {
        let mut config = DispatcherConfig::default();
        config.dispatcher.max_events_per_second = 0;
        let clock = Arc::new(ManualClock::new(START_TIME));
        let policy = Arc::new(DefaultDispatcherPolicy::new(config));
        let dispatcher = Arc::new(InputDispatcher::new(policy, clock.clone()));

        let mut windows = Vec::new();
        let mut consumers = Vec::new();
        for i in 0..window_count {
            let name = format!("window-{}", i);
            let (channel, consumer) = open_pair(&name);
            let handle = WindowHandle::new(&name);
            let mut window = InputWindow::new(handle.clone(), channel.id(), Rectangle::new(i * 10, 0, i * 10 + 10, 100));
            window.flags = WindowFlags::NOT_TOUCH_MODAL;
            window.has_focus = i == 0;
            dispatcher.register_input_channel(channel, Some(handle), false).unwrap();
            windows.push(window);
            consumers.push(consumer);
        }
        dispatcher.set_input_windows(windows);

        Self {
            dispatcher,
            clock,
            consumers,
        }
    }

    fn pump(&self) {
        while self.dispatcher.dispatch_pending() == Nsecs::MIN {}
    }

    /// Consumes and acknowledges everything sent to window `index`.
    fn drain(&self, index: usize) -> usize {
        let consumer = &self.consumers[index];
        let mut received = 0;
        self.pump();
        while let Some(message) = consumer.consume().unwrap() {
            black_box(message);
            consumer.send_finished_signal(true).unwrap();
            self.pump();
            received += 1;
        }
        received
    }

    fn key(&self, action: KeyAction) {
        let args = NotifyKeyArgs::new(self.clock.now(), 2, InputSource::KEYBOARD, action, keycodes::A);
        self.dispatcher.notify_key(args).unwrap();
    }

    fn touch(&self, action: MotionAction, x: f32) {
        let mut args = NotifyMotionArgs::new(
            self.clock.now(),
            1,
            InputSource::TOUCHSCREEN,
            action,
            vec![PointerProperties::finger(0)],
            vec![PointerCoords::at(x, 50.0)],
        );
        if action != MotionAction::Down {
            args.down_time = START_TIME;
        }
        self.dispatcher.notify_motion(args).unwrap();
    }
}

/// Benchmark a key press and release through the focused window
fn bench_key_round_trip(c: &mut Criterion) {
    let bench = Bench::new(1);

    c.bench_function("key_round_trip", |b| {
        b.iter(|| {
            bench.key(KeyAction::Down);
            black_box(bench.drain(0));
            bench.key(KeyAction::Up);
            black_box(bench.drain(0));
        })
    });
}

/// Benchmark hit testing a full gesture against growing window lists
fn bench_touch_hit_testing(c: &mut Criterion) {
    let mut group = c.benchmark_group("touch_hit_testing");

    for window_count in [10, 50, 200].iter() {
        let bench = Bench::new(*window_count);
        let last = *window_count as usize - 1;
        let x = last as f32 * 10.0 + 5.0;

        group.bench_function(format!("gesture_with_{}_windows", window_count), |b| {
            b.iter(|| {
                bench.touch(MotionAction::Down, x);
                bench.touch(MotionAction::Move, x);
                bench.touch(MotionAction::Up, x);
                black_box(bench.drain(last));
            })
        });
    }

    group.finish();
}

/// Benchmark moves piling up behind a window that is still busy
fn bench_motion_batching(c: &mut Criterion) {
    let mut group = c.benchmark_group("motion_batching");

    for sample_count in [4, 16, 64].iter() {
        group.bench_with_input(
            format!("batch_{}_moves", sample_count),
            sample_count,
            |b, &sample_count| {
                b.iter_batched(
                    || {
                        let bench = Bench::new(1);
                        bench.touch(MotionAction::Down, 5.0);
                        bench.pump();
                        bench
                    },
                    |bench| {
                        for i in 0..sample_count {
                            bench.clock.advance(5_000_000);
                            bench.touch(MotionAction::Move, 5.0 + (i % 5) as f32);
                        }
                        bench.touch(MotionAction::Up, 5.0);
                        black_box(bench.drain(0))
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_key_round_trip, bench_touch_hit_testing, bench_motion_batching);
criterion_main!(benches);
