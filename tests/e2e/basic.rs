use super::*;

#[test]
fn counts_lines() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a", "1\n2\n")?;
    space.write("b", "1\n")?;

    let out = space.run_expect(&mut skein_command(vec!["a", "b"]))?;
    assert_output_contains(&out, "       2 a\n");
    assert_output_contains(&out, "       1 b\n");
    assert_output_contains(&out, "       3 total\n");
    assert_output_contains(&out, "skein: 5 computed, 0 up to date");
    Ok(())
}

#[test]
fn chdir() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    std::fs::create_dir(space.path().join("sub"))?;
    space.write("sub/a", "x\ny\nz\n")?;

    let out = space.run_expect(&mut skein_command(vec!["-C", "sub", "-j", "1", "a"]))?;
    assert_output_contains(&out, "       3 a\n");
    Ok(())
}

#[test]
fn no_files() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run(&mut skein_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "skein: error: no files specified");
    assert_output_not_contains(&out, "total");
    Ok(())
}
