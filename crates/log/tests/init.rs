//! Global subscriber installation runs in its own test binary so the
//! one-subscriber-per-process rule does not leak into unit tests.

use tumbler_log::{Config, Format, LogError, LoggerBuilder};

#[test]
fn test_second_install_reports_already_initialized() {
    // GIVEN: a subscriber installed once
    let guard = LoggerBuilder::from_config(Config::test().with_format(Format::Json))
        .build()
        .expect("first install succeeds");
    assert_eq!(guard.format(), Format::Json);

    // WHEN: installing again
    let second = LoggerBuilder::from_config(Config::test()).build();

    // THEN: the second attempt is refused
    assert!(matches!(second, Err(LogError::AlreadyInitialized)));

    // init_test is tolerant of the existing subscriber
    tumbler_log::init_test();
    tumbler_log::info!(job = "x", "still logging");
}
