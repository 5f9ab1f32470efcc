use std::io::Write;

use cachesim_dir::common::Addr;
use cachesim_dir::config::WorkloadConfig;
use cachesim_dir::error::ConfigError;
use cachesim_dir::{run, Config, Protocol, SimError};

fn small(protocol: Protocol, workload: WorkloadConfig) -> Config {
    Config {
        protocol,
        num_cpus: 4,
        max_cycles: 500_000,
        workload,
        ..Config::default()
    }
}

fn assert_passes(config: &Config) {
    let report = run(config).unwrap();
    for check in &report.checks {
        assert!(check.passed(), "{}: expected {}, found {}", check.addr, check.expected, check.actual);
    }
    assert!(report.cycles > 0);
    assert_eq!(report.cores.len(), config.num_cpus);
}

#[test]
fn msi_spinlock_counter() {
    let config = small(Protocol::Msi, WorkloadConfig::SpinlockCounter { iterations: 10 });
    let report = run(&config).unwrap();
    assert!(report.passed());
    let counter = report.checks.iter().find(|c| c.addr == Addr(64)).unwrap();
    assert_eq!(counter.actual, 40);
}

#[test]
fn tardis_spinlock_counter() {
    let config = small(Protocol::Tardis, WorkloadConfig::SpinlockCounter { iterations: 10 });
    let report = run(&config).unwrap();
    assert!(report.passed());
    let counter = report.checks.iter().find(|c| c.addr == Addr(64)).unwrap();
    assert_eq!(counter.actual, 40);
}

#[test]
fn shared_counter_under_both_protocols() {
    for protocol in [Protocol::Msi, Protocol::Tardis] {
        assert_passes(&small(protocol, WorkloadConfig::SharedCounter { iterations: 20 }));
    }
}

#[test]
fn false_sharing_under_both_protocols() {
    for protocol in [Protocol::Msi, Protocol::Tardis] {
        assert_passes(&small(protocol, WorkloadConfig::FalseSharing { iterations: 20 }));
    }
}

#[test]
fn random_array_with_two_directories() {
    for protocol in [Protocol::Msi, Protocol::Tardis] {
        let mut config = small(
            protocol,
            WorkloadConfig::RandomArray { elements: 1024, iterations: 50, seed: 3 },
        );
        config.num_dirs = 2;
        // small enough to force evictions
        config.cache.size = 1024;
        config.cache.assoc = 2;
        let report = run(&config).unwrap();
        assert!(report.checks.is_empty());
        assert!(report.cores.iter().all(|c| c.l1.evictions > 0));
        assert_eq!(report.directories.len(), 2);
        assert!(report.network.total() > 0);
    }
}

#[test]
fn trace_files_drive_the_cores() {
    let mut first = tempfile::NamedTempFile::new().unwrap();
    writeln!(first, "# writer\n1 0x40 5\n0 0x80").unwrap();
    let mut second = tempfile::NamedTempFile::new().unwrap();
    writeln!(second, "2 4\n0 0x40\n1 0x80 9").unwrap();

    let config = Config {
        num_cpus: 2,
        workload: WorkloadConfig::Trace { files: vec![first.path().to_path_buf(), second.path().to_path_buf()] },
        ..Config::default()
    };
    let report = run(&config).unwrap();
    assert!(report.checks.is_empty());
    assert_eq!(report.cores[0].sequencer.stores, 1);
    assert_eq!(report.cores[0].sequencer.loads, 1);
    assert_eq!(report.cores[1].sequencer.stores, 1);
    assert_eq!(report.cores[1].retired, 3);
}

#[test]
fn trace_count_must_match_cpus() {
    let trace = tempfile::NamedTempFile::new().unwrap();
    let config = Config {
        num_cpus: 2,
        workload: WorkloadConfig::Trace { files: vec![trace.path().to_path_buf()] },
        ..Config::default()
    };
    assert_eq!(
        run(&config),
        Err(SimError::Config(ConfigError::WorkloadCount { expected: 2, got: 1 }))
    );
}

#[test]
fn gives_up_after_max_cycles() {
    let mut config = small(Protocol::Msi, WorkloadConfig::SpinlockCounter { iterations: 1000 });
    config.max_cycles = 100;
    assert!(matches!(run(&config), Err(SimError::Timeout { max_cycles: 100, .. })));
}

#[test]
fn invalid_config_is_rejected_before_running() {
    let mut config = Config::default();
    config.cache.line_size = 48;
    assert!(matches!(run(&config), Err(SimError::Config(ConfigError::NotPowerOfTwo { .. }))));
}

#[test]
fn loads_toml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
protocol = "tardis"
num_cpus = 2

[cache]
assoc = 4

[tardis]
lease = 20

[workload]
kind = "shared_counter"
iterations = 5
"#
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.protocol, Protocol::Tardis);
    assert_eq!(config.num_cpus, 2);
    assert_eq!(config.cache.assoc, 4);
    assert_eq!(config.cache.line_size, 64);
    assert_eq!(config.tardis.lease, 20);
    assert_eq!(config.workload, WorkloadConfig::SharedCounter { iterations: 5 });
    assert!(run(&config).unwrap().passed());
}

#[test]
fn missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    assert!(matches!(Config::load(Some(path.as_path())), Err(ConfigError::Load(_))));
}

#[test]
fn unknown_protocol_in_file_is_an_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "protocol = \"MOESI\"").unwrap();
    let err = Config::load(Some(file.path())).unwrap_err();
    assert!(matches!(&err, ConfigError::Load(msg) if msg.contains("MOESI")), "{err}");
}

#[test]
fn full_inbound_buffers_hold_messages_in_the_network() {
    for protocol in [Protocol::Msi, Protocol::Tardis] {
        let mut config = small(protocol, WorkloadConfig::SharedCounter { iterations: 20 });
        config.buffers.inbound = 2;
        let report = run(&config).unwrap();
        assert!(report.passed(), "{protocol}");
        assert!(report.network.refused > 0, "{protocol}");
        assert_eq!(report.network.delivered, report.network.total());
    }
}

fn tight(protocol: Protocol, workload: WorkloadConfig) -> Config {
    let mut config = small(protocol, workload);
    config.sequencer.max_outstanding = 1;
    config.buffers.transitions_per_cycle = 1;
    config.buffers.link_bandwidth = 3;
    config.buffers.l1_out = 2;
    config.buffers.mandatory = 1;
    config.buffers.inbound = 1;
    config.latency.link = 3;
    config
}

#[test]
fn blocking_cores_with_tight_buffers() {
    for protocol in [Protocol::Msi, Protocol::Tardis] {
        for workload in [
            WorkloadConfig::SpinlockCounter { iterations: 5 },
            WorkloadConfig::SharedCounter { iterations: 10 },
            WorkloadConfig::FalseSharing { iterations: 10 },
            WorkloadConfig::RandomArray { elements: 512, iterations: 20, seed: 1 },
        ] {
            let config = tight(protocol, workload.clone());
            let report = run(&config).unwrap_or_else(|e| panic!("{protocol} {workload:?}: {e}"));
            assert!(report.passed(), "{protocol} {workload:?}");
        }
    }
}
