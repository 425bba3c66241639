//! Integration test for whole runs: launcher, lifecycle, group and writer
//! together on the emulated device.

use arbor::{
    launch, launch_with, DirectSolver, GravitySolver, GroupSource, ParticleStore, RunConfig,
    SimulationLifecycle, SolverError, SolverResult,
};
use arbor_core::{EmulatedDevice, LocalGroup, ProcessGroup};
use arbor_io::read_file;
use std::path::Path;
use std::sync::Arc;
use std::thread;

/// `sections` plus an `[output]` table pointing at `dir`.
fn config(dir: &Path, sections: &str, output: &str) -> RunConfig {
    let text = format!("{sections}\n[output]\ndir = \"{}\"\n{output}\n", dir.display());
    RunConfig::from_toml_str(&text).unwrap()
}

/// Runs one lifecycle per rank through `steps(rank, lifecycle)` and returns
/// what each thread produced, in rank order.
fn on_ranks<T, F>(config: &RunConfig, steps: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize, SimulationLifecycle) -> T + Send + Clone + 'static,
{
    let device = Arc::new(EmulatedDevice::new(1));
    let handles: Vec<_> = LocalGroup::create(config.group.ranks)
        .into_iter()
        .map(|group| {
            let rank = group.rank();
            let member: Arc<dyn ProcessGroup> = Arc::new(group);
            let lifecycle =
                SimulationLifecycle::new(config.clone(), device.clone(), GroupSource::Owned(member));
            let steps = steps.clone();
            thread::spawn(move || steps(rank, lifecycle))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn group_totals(config: &RunConfig) -> (u64, f64) {
    let totals = on_ranks(config, |_, mut run| {
        run.bootstrap().unwrap();
        run.load_initial_conditions().unwrap();
        run.upload().unwrap();
        let totals = run.totals().unwrap();
        assert_eq!(run.shutdown(0), 0);
        totals
    });
    // Every rank sees the same reduction.
    assert!(totals.windows(2).all(|w| w[0] == w[1]));
    (totals[0].bodies, totals[0].mass)
}

struct Diverging;

impl GravitySolver for Diverging {
    fn iterate(&mut self, _particles: &mut ParticleStore) -> SolverResult<()> {
        Err(SolverError::Failed("diverged".to_string()))
    }

    fn t_current(&self) -> f64 {
        0.0
    }

    fn set_t_current(&mut self, _t: f64) {}
}

#[test]
fn test_two_rank_sphere_matches_single_rank_mass() {
    let dir = tempfile::tempdir().unwrap();
    let single = config(dir.path(), "[initial]\nsphere = 1000", "");
    let pair = config(
        dir.path(),
        "[initial]\nsphere = 500\n[group]\nranks = 2\n[logging]\nlog_file = \"pair.log\"",
        "",
    );

    let (n1, m1) = group_totals(&single);
    let (n2, m2) = group_totals(&pair);
    assert_eq!(n1, 1000);
    assert_eq!(n2, 1000);
    assert!((m1 - m2).abs() < 1e-5, "{m1} vs {m2}");
    assert!((m1 - 1.0).abs() < 1e-4);

    // Multi-rank logs carry the group size and rank.
    assert!(dir.path().join("gpuLog.log").exists());
    assert!(dir.path().join("pair.log-2-0").exists());
    assert!(dir.path().join("pair.log-2-1").exists());
}

#[test]
fn test_snapshot_at_two_and_a_half() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(
        dir.path(),
        "[physics]\ndt = 0.5\nt_end = 2.5\n[initial]\nplummer = 60\n[group]\nranks = 2",
        "snapshot_base = \"snap_\"\nsnapshot_interval = 2.5",
    );
    assert_eq!(launch(&config), 0);

    let path = dir.path().join("snap__00002.5000");
    assert!(path.to_string_lossy().contains("2.5000"));
    let file = read_file(&path).unwrap();
    assert_eq!(file.header.n_bodies, 120);
    assert_eq!(file.ids.len(), 120);
    assert_eq!(file.positions.len(), 120);
    assert!((file.header.t_current - 2.5).abs() < 1e-12);

    // Exactly one dataset: the boundary at 2.5.
    let snapshots = std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with("snap_")
        })
        .count();
    assert_eq!(snapshots, 1);
}

#[test]
fn test_large_group_writes_per_rank_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(
        dir.path(),
        "[physics]\ndt = 0.25\nt_end = 0.5\n[initial]\ncube = 10\n[group]\nranks = 3",
        "snapshot_base = \"big\"\nsnapshot_every = 2\ncombined_max_procs = 2",
    );
    assert_eq!(launch(&config), 0);

    for rank in 0..3u64 {
        let file = read_file(&dir.path().join(format!("big_00000.5000-{rank}"))).unwrap();
        assert_eq!(file.ids.len(), 10);
        assert_eq!(file.ids[0], rank * 10);
    }
}

#[test]
fn test_restart_from_own_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let first = config(
        dir.path(),
        "[physics]\ndt = 0.5\nt_end = 1.0\n[initial]\nsphere = 32",
        "snapshot_base = \"warm\"\nsnapshot_interval = 1.0",
    );
    assert_eq!(launch(&first), 0);

    let snapshot = dir.path().join("warm_00001.0000");
    let sections = format!(
        "[physics]\ndt = 0.5\nt_end = 2.0\n[initial]\nfile = \"{}\"\ncollective = true\n[group]\nranks = 2",
        snapshot.display()
    );
    let second = config(dir.path(), &sections, "snapshot_base = \"hot\"\nsnapshot_interval = 1.0");
    let times = on_ranks(&second, |_, mut run| {
        run.bootstrap().unwrap();
        run.load_initial_conditions().unwrap();
        run.upload().unwrap();
        let start = run.t_current();
        run.iterate().unwrap();
        let end = run.t_current();
        assert_eq!(run.shutdown(0), 0);
        (start, end)
    });
    for (start, end) in times {
        assert!((start - 1.0).abs() < 1e-12);
        assert!((end - 2.0).abs() < 1e-12);
    }
    let resumed = read_file(&dir.path().join("hot_00002.0000")).unwrap();
    assert_eq!(resumed.ids.len(), 32);
}

#[test]
fn test_failing_rank_aborts_the_group() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(
        dir.path(),
        "[physics]\ndt = 0.01\nt_end = 100.0\n[initial]\nsphere = 20\n[group]\nranks = 2",
        "",
    );
    let codes = on_ranks(&config, |rank, run| {
        let run = if rank == 1 {
            run.with_solver(Box::new(Diverging))
        } else {
            run
        };
        run.run()
    });
    // The failing rank reports a computation fault; its peer sees the abort.
    assert_eq!(codes, vec![4, 4]);
}

#[test]
fn test_launcher_reports_first_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(
        dir.path(),
        "[physics]\ndt = 0.01\nt_end = 100.0\n[initial]\ncube = 20\n[group]\nranks = 3",
        "",
    );
    let code = launch_with(&config, &|config: &RunConfig, rank: usize| -> Box<dyn GravitySolver> {
        if rank == 2 {
            Box::new(Diverging)
        } else {
            Box::new(DirectSolver::new(config.physics.eps, config.physics.dt))
        }
    });
    assert_eq!(code, 4);
}

#[test]
fn test_configuration_error_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "[initial]\nplummer = 10\ncube = 10", "");
    assert_eq!(launch(&config), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_device_exhaustion_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(
        dir.path(),
        "[device]\ncapacity_bytes = 1024\n[initial]\ncube = 1000",
        "",
    );
    assert_eq!(launch(&config), 2);
}
