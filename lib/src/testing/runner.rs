use crate::klog_info;
use crate::testing::TestResult;

/// Run one test function and log its outcome. Failures always log; passes
/// only log at debug level to keep suite output readable.
pub fn run_single_test<F: FnOnce() -> TestResult>(name: &str, test: F) -> TestResult {
    let result = test();
    match result {
        TestResult::Pass => {
            crate::klog_debug!("TEST PASS: {}", name);
        }
        TestResult::Fail => {
            klog_info!("TEST FAIL: {}", name);
        }
        TestResult::Skipped => {
            klog_info!("TEST SKIP: {}", name);
        }
    }
    result
}
