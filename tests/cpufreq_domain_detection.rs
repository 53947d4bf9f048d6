//! Cpufreq domain detection (`spec.md` §8 scenario 5): the width of a
//! policy's `affected_cpus` list, classified against a fixed topology
//! shape, resolves to the domain table in `spec.md` §4.2.

use geopm::pio::CpufreqDriver;
use geopm::types::Domain;

fn write_policy(root: &std::path::Path, policy_index: u32, affected_cpus: &str) {
    let dir = root.join(format!("policy{policy_index}"));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("affected_cpus"), affected_cpus).unwrap();
}

#[test]
fn affected_cpus_width_resolves_to_the_spec_table() {
    let tmp = tempfile::tempdir().unwrap();
    write_policy(tmp.path(), 0, "0");
    write_policy(tmp.path(), 1, "0 4");
    write_policy(tmp.path(), 2, "0 1 4 5");
    write_policy(tmp.path(), 3, "0 1 2 3 4 5 6 7");

    let driver = CpufreqDriver::with_root(tmp.path().to_path_buf());

    // Fixed topology shape used throughout: 2 core-siblings, 4 CPUs per
    // package, 8 CPUs total on the board.
    let num_core_siblings = 2;
    let num_package_cpus = 4;
    let num_board_cpus = 8;

    let cases: [(u32, Domain); 4] = [
        (0, Domain::Cpu),
        (1, Domain::Core),
        (2, Domain::Package),
        (3, Domain::Board),
    ];

    for (policy_index, expected) in cases {
        let affected = driver.affected_cpus(policy_index).unwrap();
        let domain = CpufreqDriver::classify_domain(
            affected.len(),
            num_core_siblings,
            num_package_cpus,
            num_board_cpus,
        );
        assert_eq!(domain, expected, "policy{policy_index} should classify as {expected}");
    }
}
