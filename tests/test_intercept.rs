use serial_test::serial;  // the trace options can be overridden from the environment
use tempfile::tempdir;

use intercept;

mod common;

use common::{analyzer_invocations, fake_analyzer, replay_options, write_trace};

#[test_log::test]
#[serial]
fn test_replay_build_trace() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let work = dir.path().to_string_lossy().into_owned();
    let analyzer = fake_analyzer(dir.path())?;
    let trace = write_trace(dir.path(), &[
        String::from("100 execve(\"/usr/bin/make\", [\"make\"], [\"PATH=/bin\"]) = 0"),
        format!("100 chdir(\"{}\") = 0", work),
        String::from("100 clone(child_stack=NULL, flags=CLONE_CHILD_CLEARTID|SIGCHLD <unfinished ...>"),
        // The child's first line shows up before the clone returns
        String::from("101 execve(\"/nonexistent/bin/gcc\", [\"gcc\", \"-c\", \"a.c\"], [\"FOO=bar\", \"PATH=/bin\"]) = 0"),
        String::from("100 <... clone resumed>, child_tidptr=0x7f3c) = 101"),
        String::from("100 vfork() = 102"),
        String::from("102 execve(\"/nonexistent/bin/gcc\", [\"gcc\", \"-c\", \"conftest.c\"], [\"FOO=probe\"]) = 0"),
        String::from("102 +++ exited with 0 +++"),
        String::from("100 clone(child_stack=NULL, flags=SIGCHLD) = 103"),
        String::from("103 chdir(\"sub\") = -1 ENOENT (No such file or directory)"),
        String::from("103 execve(\"/nonexistent/bin/cc\", [\"cc\", \"-I/opt/include\", \"b.c\"], [\"FOO=baz\"] <unfinished ...>"),
        String::from("101 +++ exited with 0 +++"),
        String::from("103 <... execve resumed>) = 0"),
        String::from("103 +++ exited with 0 +++"),
        String::from("100 +++ exited with 0 +++"),
    ])?;

    let ec = intercept::run_interceptor(replay_options(&trace, &analyzer))?;
    assert_eq!(ec, 0);
    assert_eq!(analyzer_invocations(dir.path()),
               vec!["/nonexistent/bin/cc|true|baz|-I/opt/include b.c -g -I/usr/include",
                    "/nonexistent/bin/gcc|true|bar|-c a.c -g -I/usr/include"]);
    Ok(())
}

#[test]
#[serial]
fn test_non_compiler_execs_are_not_analyzed() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let work = dir.path().to_string_lossy().into_owned();
    let analyzer = fake_analyzer(dir.path())?;
    let trace = write_trace(dir.path(), &[
        String::from("7 execve(\"/bin/sh\", [\"sh\", \"-c\", \"ls\"], []) = 0"),
        format!("7 chdir(\"{}\") = 0", work),
        String::from("7 execve(\"/bin/ls\", [\"ls\"], []) = 0"),
        String::from("7 execve(\"/usr/bin/gcc-nm\", [\"gcc-nm\", \"a.o\"], []) = 0"),
        String::from("7 +++ exited with 0 +++"),
    ])?;

    let ec = intercept::run_interceptor(replay_options(&trace, &analyzer))?;
    assert_eq!(ec, 0);
    assert!(analyzer_invocations(dir.path()).is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_trace_must_start_with_exec() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let analyzer = fake_analyzer(dir.path())?;
    let trace = write_trace(dir.path(), &[
        String::from("7 chdir(\"/tmp\") = 0"),
        String::from("7 execve(\"/usr/bin/gcc\", [\"gcc\", \"a.c\"], []) = 0"),
    ])?;
    assert_eq!(intercept::run_interceptor(replay_options(&trace, &analyzer))?, 1);

    let empty = write_trace(dir.path(), &[])?;
    assert_eq!(intercept::run_interceptor(replay_options(&empty, &analyzer))?, 1);
    assert!(analyzer_invocations(dir.path()).is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_missing_trace_file_is_an_error() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let analyzer = fake_analyzer(dir.path())?;
    let res = intercept::run_interceptor(replay_options(&dir.path().join("missing.trace"), &analyzer));
    assert!(res.is_err());
    Ok(())
}

#[test]
#[serial]
fn test_compiler_regexp_from_environment() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let work = dir.path().to_string_lossy().into_owned();
    let analyzer = fake_analyzer(dir.path())?;
    let trace = write_trace(dir.path(), &[
        String::from("7 execve(\"/usr/bin/gcc\", [\"gcc\", \"a.c\"], [\"FOO=driver\"]) = 0"),
        format!("7 chdir(\"{}\") = 0", work),
        String::from("7 execve(\"/usr/lib/gcc/x86_64-linux-gnu/9/cc1\", [\"cc1\", \"a.c\"], [\"FOO=cc1\"]) = 0"),
        String::from("7 +++ exited with 0 +++"),
    ])?;

    std::env::set_var("COMPILER_REGEXP", r#"^"(?:.*/)?(?:cc1(?:plus)?|clang)"$"#);
    let opts = replay_options(&trace, &analyzer);
    std::env::remove_var("COMPILER_REGEXP");

    assert_eq!(intercept::run_interceptor(opts)?, 0);
    assert_eq!(analyzer_invocations(dir.path()),
               vec!["/usr/lib/gcc/x86_64-linux-gnu/9/cc1|true|cc1|a.c -g -I/usr/include"]);
    Ok(())
}
