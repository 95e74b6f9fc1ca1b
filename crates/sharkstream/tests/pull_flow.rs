#[cfg(unix)]
mod support;

#[cfg(unix)]
mod unix {
    use semver::Version;
    use sharkstream::{CaptureBuilder, CaptureError, JsonRecordDecoder, RawRecordDecoder};
    use tempfile::TempDir;

    use super::support::{
        recorded_args, write_fake_tshark, write_versioned_tshark, JSON_LEGACY, JSON_MODERN,
        PDML_TWO_PACKETS, PSML_WITH_STRUCTURE,
    };

    #[tokio::test]
    async fn pull_yields_tagged_records_then_end_of_stream() {
        let dir = TempDir::new().expect("temp dir");
        let tshark = write_fake_tshark(dir.path(), PDML_TWO_PACKETS, "");

        let mut capture = CaptureBuilder::interface("lo")
            .binary(&tshark)
            .build(RawRecordDecoder)
            .expect("build");

        let first = capture.next().await.expect("first").expect("packet");
        let second = capture.next().await.expect("second").expect("packet");
        assert_eq!(first.text, "<packet>A</packet>");
        assert_eq!(second.text, "<packet>B</packet>");
        assert!(first.structure.is_none());

        assert!(capture.next().await.expect("eof").is_none());
        assert!(capture.next().await.expect("still eof").is_none());
        assert_eq!(capture.live_process_count(), 0);
        assert_eq!(
            recorded_args(dir.path()),
            ["-l", "-n", "-T", "pdml", "-i", "lo"]
        );
    }

    #[tokio::test]
    async fn pull_reports_nonzero_exit_as_crash() {
        let dir = TempDir::new().expect("temp dir");
        let tshark = write_fake_tshark(dir.path(), "", "exit 2");

        let mut capture = CaptureBuilder::interface("lo")
            .binary(&tshark)
            .build(RawRecordDecoder)
            .expect("build");

        match capture.next().await {
            Err(CaptureError::ExternalProcessCrashed { code, invocation }) => {
                assert_eq!(code, 2);
                assert_eq!(invocation.binary(), tshark.as_path());
                assert!(invocation.to_string().ends_with("-i lo"), "{invocation}");
            }
            other => panic!("expected crash, got {other:?}"),
        }
        assert_eq!(capture.live_process_count(), 0);
    }

    #[tokio::test]
    async fn crash_after_output_surfaces_once_records_are_drained() {
        let dir = TempDir::new().expect("temp dir");
        let tshark = write_fake_tshark(dir.path(), "<packet>only</packet>\n", "sleep 0.2; exit 3");

        let mut capture = CaptureBuilder::interface("lo")
            .binary(&tshark)
            .build(RawRecordDecoder)
            .expect("build");

        let packet = capture.next().await.expect("packet").expect("some");
        assert_eq!(packet.text, "<packet>only</packet>");
        assert!(matches!(
            capture.next().await,
            Err(CaptureError::ExternalProcessCrashed { code: 3, .. })
        ));
        assert_eq!(capture.live_process_count(), 0);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = TempDir::new().expect("temp dir");
        let mut capture = CaptureBuilder::interface("lo")
            .binary(dir.path().join("no-such-tshark"))
            .build(RawRecordDecoder)
            .expect("build");

        assert!(matches!(
            capture.next().await,
            Err(CaptureError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn summaries_carry_the_structure_prologue() {
        let dir = TempDir::new().expect("temp dir");
        let tshark = write_fake_tshark(dir.path(), PSML_WITH_STRUCTURE, "");

        let mut capture = CaptureBuilder::interface("lo")
            .binary(&tshark)
            .only_summaries(true)
            .build(RawRecordDecoder)
            .expect("build");

        let first = capture.next().await.expect("first").expect("packet");
        let second = capture.next().await.expect("second").expect("packet");
        assert!(capture.next().await.expect("eof").is_none());

        let structure = first.structure.as_deref().expect("structure");
        assert!(structure.starts_with("<structure>"));
        assert!(structure.contains("<section>Protocol</section>"));
        assert_eq!(second.structure.as_deref(), Some(structure));
        assert_eq!(
            first.text,
            "<packet>\n<section>1</section>\n<section>DNS</section>\n</packet>"
        );
        assert_eq!(recorded_args(dir.path())[..4], ["-l", "-n", "-T", "psml"]);
    }

    #[tokio::test]
    async fn summaries_without_structure_still_yield_packets() {
        let dir = TempDir::new().expect("temp dir");
        let tshark = write_fake_tshark(dir.path(), "<packet>1</packet>\n", "");

        let mut capture = CaptureBuilder::interface("lo")
            .binary(&tshark)
            .only_summaries(true)
            .build(RawRecordDecoder)
            .expect("build");

        let packet = capture.next().await.expect("packet").expect("some");
        assert_eq!(packet.text, "<packet>1</packet>");
        assert!(packet.structure.is_none());
    }

    #[tokio::test]
    async fn json_records_follow_modern_layout() {
        let dir = TempDir::new().expect("temp dir");
        let tshark = write_fake_tshark(dir.path(), JSON_MODERN, "");

        let mut capture = CaptureBuilder::interface("lo")
            .binary(&tshark)
            .use_json(true)
            .include_raw(true)
            .tshark_version(Version::new(3, 6, 2))
            .build(JsonRecordDecoder)
            .expect("build");

        let first = capture.next().await.expect("first").expect("packet");
        let second = capture.next().await.expect("second").expect("packet");
        assert!(capture.next().await.expect("eof").is_none());

        assert_eq!(first["_index"], "packets-1");
        assert_eq!(
            second["_source"]["layers"]["frame"]["frame.number"],
            "2"
        );
        assert_eq!(
            recorded_args(dir.path()),
            ["-l", "-n", "-T", "json", "-x", "-i", "lo"]
        );
    }

    #[tokio::test]
    async fn probed_version_selects_legacy_json_layout_and_filter_flag() {
        let dir = TempDir::new().expect("temp dir");
        let tshark = write_versioned_tshark(
            dir.path(),
            "TShark (Wireshark) 2.6.10 (Git v2.6.10 packaged as 2.6.10-1~ubuntu18.04.0)",
            JSON_LEGACY,
            "",
        );

        let mut capture = CaptureBuilder::interface("lo")
            .binary(&tshark)
            .use_json(true)
            .display_filter("dns")
            .build(JsonRecordDecoder)
            .expect("build");

        assert_eq!(
            capture.tshark_version().await.expect("version"),
            &Version::new(2, 6, 10)
        );

        let mut indexes = Vec::new();
        while let Some(packet) = capture.next().await.expect("packet") {
            indexes.push(packet["_index"].as_str().expect("index").to_string());
        }
        assert_eq!(indexes, ["packets-1", "packets-2"]);
        assert_eq!(
            recorded_args(dir.path()),
            ["-l", "-n", "-T", "json", "-Y", "dns", "-i", "lo"]
        );
    }

    #[tokio::test]
    async fn json_is_refused_for_old_tshark() {
        let dir = TempDir::new().expect("temp dir");
        let tshark = write_fake_tshark(dir.path(), JSON_MODERN, "");

        let mut capture = CaptureBuilder::interface("lo")
            .binary(&tshark)
            .use_json(true)
            .tshark_version(Version::new(2, 0, 0))
            .build(JsonRecordDecoder)
            .expect("build");

        assert!(matches!(
            capture.next().await,
            Err(CaptureError::JsonUnsupported { .. })
        ));
        assert_eq!(capture.live_process_count(), 0);
    }

    #[tokio::test]
    async fn decode_failures_propagate_and_reap_the_process() {
        let dir = TempDir::new().expect("temp dir");
        let tshark = write_fake_tshark(dir.path(), "[\n  {\n    \"broken\": \n  },\n", "exec sleep 30");

        let mut capture = CaptureBuilder::interface("lo")
            .binary(&tshark)
            .use_json(true)
            .tshark_version(Version::new(3, 0, 0))
            .build(JsonRecordDecoder)
            .expect("build");

        assert!(matches!(capture.next().await, Err(CaptureError::Decode(_))));
        assert_eq!(capture.live_process_count(), 0);
        assert!(capture.next().await.expect("finished").is_none());
    }

    #[tokio::test]
    async fn indexed_access_pulls_forward_and_advances_the_cursor() {
        let dir = TempDir::new().expect("temp dir");
        let tshark = write_fake_tshark(dir.path(), PDML_TWO_PACKETS, "");

        let mut capture = CaptureBuilder::interface("lo")
            .binary(&tshark)
            .build(RawRecordDecoder)
            .expect("build");

        assert_eq!(capture.get(0).await.expect("index 0").text, "<packet>A</packet>");
        assert_eq!(capture.len(), 1);

        let next = capture.next().await.expect("next").expect("packet");
        assert_eq!(next.text, "<packet>B</packet>");
        assert_eq!(capture.get(0).await.expect("retained").text, "<packet>A</packet>");
        assert!(capture.next().await.expect("eof").is_none());
        assert_eq!(capture.len(), 2);

        assert!(matches!(
            capture.get(5).await,
            Err(CaptureError::IndexNotFound { index: 5 })
        ));

        capture.reset();
        let replayed = capture.next().await.expect("replay").expect("packet");
        assert_eq!(replayed.text, "<packet>A</packet>");
        assert_eq!(capture.to_string(), "<CaptureSession interface lo (2 packets)>");

        capture.clear();
        assert!(capture.is_empty());
        assert!(capture.next().await.expect("cleared").is_none());
    }

    #[tokio::test]
    async fn indexed_access_requires_retention() {
        let dir = TempDir::new().expect("temp dir");
        let tshark = write_fake_tshark(dir.path(), PDML_TWO_PACKETS, "");

        let mut capture = CaptureBuilder::interface("lo")
            .binary(&tshark)
            .keep_packets(false)
            .build(RawRecordDecoder)
            .expect("build");

        assert!(matches!(
            capture.get(0).await,
            Err(CaptureError::HistoryDisabled)
        ));
        assert!(capture.next().await.expect("first").is_some());
        assert!(capture.is_empty());
        assert_eq!(capture.to_string(), "<CaptureSession interface lo>");
    }

    #[tokio::test]
    async fn close_kills_an_in_flight_pull_round() {
        let dir = TempDir::new().expect("temp dir");
        let tshark = write_fake_tshark(dir.path(), PDML_TWO_PACKETS, "exec sleep 30");

        let mut capture = CaptureBuilder::interface("lo")
            .binary(&tshark)
            .build(RawRecordDecoder)
            .expect("build");

        assert!(capture.next().await.expect("first").is_some());
        assert_eq!(capture.live_process_count(), 1);

        capture.close().await.expect("close");
        capture.close().await.expect("close again");
        assert_eq!(capture.live_process_count(), 0);
        assert!(capture.is_closed());
    }
}
