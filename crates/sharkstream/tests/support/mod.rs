#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

pub const PDML_TWO_PACKETS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<pdml version="0" creator="wireshark/3.6.2">
<packet>A</packet>
<packet>B</packet>
</pdml>
"#;

pub const PDML_FIVE_PACKETS: &str = "<pdml>
<packet>1</packet>
<packet>2</packet>
<packet>3</packet>
<packet>4</packet>
<packet>5</packet>
</pdml>
";

pub const PSML_WITH_STRUCTURE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<psml version="0" creator="wireshark/3.6.2">
<structure>
<section>No.</section>
<section>Protocol</section>
</structure>

<packet>
<section>1</section>
<section>DNS</section>
</packet>

<packet>
<section>2</section>
<section>DNS</section>
</packet>

</psml>
"#;

/// `-T json` layout written by tshark 3.x.
pub const JSON_MODERN: &str = r#"[
  {
    "_index": "packets-1",
    "_source": {
      "layers": {"frame": {"frame.number": "1"}}
    }
  },
  {
    "_index": "packets-2",
    "_source": {
      "layers": {"frame": {"frame.number": "2"}}
    }
  }
]
"#;

/// `-T json` layout written by tshark 2.x.
pub const JSON_LEGACY: &str = "[\n  {\n    \"_index\": \"packets-1\"\n  }\n\n  ,\n  {\n    \"_index\": \"packets-2\"\n  }\n\n]\n";

fn write_executable(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, script).expect("write script");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path
}

/// Fake tshark that records its arguments, prints `stdout` and then runs `after`.
pub fn write_fake_tshark(dir: &Path, stdout: &str, after: &str) -> PathBuf {
    write_script(dir, None, stdout, after)
}

/// Like [`write_fake_tshark`], but also answers `-v` with `version_line`.
pub fn write_versioned_tshark(dir: &Path, version_line: &str, stdout: &str, after: &str) -> PathBuf {
    write_script(dir, Some(version_line), stdout, after)
}

fn write_script(dir: &Path, version_line: Option<&str>, stdout: &str, after: &str) -> PathBuf {
    let fixture = dir.join("stdout.txt");
    fs::write(&fixture, stdout).expect("write fixture");

    let probe = match version_line {
        Some(line) => format!(
            "if [ \"${{1:-}}\" = \"-v\" ]; then\n  echo '{line}'\n  echo 'Copyright 1998-2020 Gerald Combs'\n  exit 0\nfi\n"
        ),
        None => String::new(),
    };
    let script = format!(
        "#!/bin/sh\nset -eu\n{probe}printf '%s\\n' \"$@\" > '{args}'\ncat '{fixture}'\n{after}\n",
        args = args_path(dir).display(),
        fixture = fixture.display(),
    );
    write_executable(dir, "tshark", &script)
}

fn args_path(dir: &Path) -> PathBuf {
    dir.join("args.txt")
}

/// Arguments of the most recent (non-probe) invocation.
pub fn recorded_args(dir: &Path) -> Vec<String> {
    fs::read_to_string(args_path(dir))
        .expect("read recorded args")
        .lines()
        .map(str::to_string)
        .collect()
}
