#[path = "common/mod.rs"]
mod common;

use common::*;
use flowcap::search::descriptor::SearchDescriptor;
use flowcap::{run_search, IndexKey, PcapReader, SearchOptions, TimeVal32};
use std::path::Path;

/// 10,000 single-packet flows with distinct srcports 0..9999; large
/// enough that the SRCPORT index carries a preview tree.
fn port_corpus(dir: &Path) -> std::path::PathBuf {
    let mut packets = Vec::new();
    for i in 0..10_000u32 {
        let port = i as u16;
        packets.push(TestPacket {
            ts: TimeVal32::new(1_700_000_000 + i, 0),
            frame: udp_frame(
                [10, (i >> 8) as u8, i as u8, 1],
                [192, 168, 1, 1],
                port,
                4000,
                b"q",
            ),
        });
    }
    let pcap = dir.join("ports.pcap");
    write_pcap(&pcap, &packets);
    pcap
}

fn search_opts(base: &Path) -> SearchOptions {
    SearchOptions::default()
        .with_base_dir(base)
        .with_threads(2)
        .with_progress(false)
}

#[test]
fn preview_guided_range_scan_finds_all_matches() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("data");
    let pcap = port_corpus(dir.path());
    run_capture(&base, &pcap);

    let interval = interval_dir(&base, 0);

    // The SRCPORT index is big enough for a preview block: every eighth
    // entry of 10,000 at depth <= 11.
    let (hdr, entries) = read_projection_index(&interval.join("SRCPORT"));
    assert_eq!(hdr.records, 10_000);
    assert_eq!(hdr.preview, 1250);
    let preview = read_preview_keys(&interval.join("SRCPORT"));
    assert_eq!(preview.len(), 1250);
    // Preview keys are the serialized entries at positions 8, 16, 24, ...
    assert_eq!(preview[0], entries[7].0);
    assert_eq!(preview[1], entries[15].0);
    assert_eq!(*preview.last().unwrap(), entries[9999].0);

    let descr = SearchDescriptor::parse(
        "SRCPORT ports_500_600 500 600\nAND and0 0\nOR combined\nFULL res 0\n",
    )
    .unwrap();
    run_search(&descr, &search_opts(&base)).unwrap();

    // 101 distinct ports, one flow each.
    let offsets = read_offset_set(&interval.join("combined"));
    assert_eq!(offsets.len(), 101);
    let flows = read_flow_set(&interval.join("res.flows"));
    assert_eq!(flows.len(), 101);
    for rec in &flows {
        assert!((500..=600).contains(&rec.key.srcport));
    }

    // The sub-search result agrees with a brute-force pass over the
    // index.
    let expected: Vec<u64> = entries
        .iter()
        .filter(|(k, _)| {
            (IndexKey::Port(500)..=IndexKey::Port(600)).contains(k)
        })
        .map(|(_, off)| *off)
        .collect();
    let mut expected_sorted = expected.clone();
    expected_sorted.sort_unstable();
    assert_eq!(read_offset_set(&interval.join("ports_500_600")), expected_sorted);
}

#[test]
fn search_results_are_idempotent_across_reruns() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("data");
    let pcap = port_corpus(dir.path());
    run_capture(&base, &pcap);
    let interval = interval_dir(&base, 0);

    let descr = SearchDescriptor::parse(
        "SRCPORT narrow 100 110\nAND and0 0\nOR orres\nFULL res 0\n",
    )
    .unwrap();
    run_search(&descr, &search_opts(&base)).unwrap();

    let result_files = ["narrow", "and0", "orres", "res.flows"];
    let first: Vec<Vec<u8>> = result_files
        .iter()
        .map(|f| std::fs::read(interval.join(f)).unwrap())
        .collect();

    // Remove everything and rebuild from the indexes alone.
    for f in &result_files {
        std::fs::remove_file(interval.join(f)).unwrap();
    }
    run_search(&descr, &search_opts(&base)).unwrap();
    for (f, bytes) in result_files.iter().zip(&first) {
        assert_eq!(&std::fs::read(interval.join(f)).unwrap(), bytes, "{f}");
    }

    // A third run with everything present is a no-op success.
    run_search(&descr, &search_opts(&base)).unwrap();
}

#[test]
fn partial_intervals_apply_the_time_filter() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("data");

    // Ten flows, one packet per second from t=1000.
    let mut packets = Vec::new();
    for i in 0..10u32 {
        packets.push(TestPacket {
            ts: TimeVal32::new(1000 + i, 0),
            frame: udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 6000 + i as u16, 53, b"t"),
        });
    }
    let pcap = dir.path().join("timed.pcap");
    write_pcap(&pcap, &packets);
    run_capture(&base, &pcap);
    let interval = interval_dir(&base, 0);

    let descr = SearchDescriptor::parse(
        "SRCPORT all 6000 6009\nAND a 0\nOR o\nSTART 1003.0\nEND 1006.0\nPARTIAL res 0\n",
    )
    .unwrap();
    run_search(&descr, &search_opts(&base)).unwrap();

    let flows = read_flow_set(&interval.join("res.flows"));
    assert_eq!(flows.len(), 4);
    for rec in &flows {
        assert!(rec.key.last_ts >= TimeVal32::new(1003, 0));
        assert!(rec.key.first_ts <= TimeVal32::new(1006, 0));
    }
}

#[test]
fn proto_filter_rejects_other_transports() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("data");
    let pcap = port_corpus(dir.path());
    run_capture(&base, &pcap);
    let interval = interval_dir(&base, 0);

    // Everything in the corpus is UDP; asking for TCP returns nothing.
    let descr = SearchDescriptor::parse(
        "SRCPORT w 0 9999\nAND a 0\nOR o\nPROTO 6\nFULL res 0\n",
    )
    .unwrap();
    run_search(&descr, &search_opts(&base)).unwrap();
    assert!(read_flow_set(&interval.join("res.flows")).is_empty());
}

#[test]
fn fetched_pcap_is_in_strict_time_order() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("data");

    // Flow X packets at t = 1, 4, 5; flow Y at t = 2, 3, 6.
    let times_x = [1u32, 4, 5];
    let times_y = [2u32, 3, 6];
    let mut packets = Vec::new();
    for t in times_x {
        packets.push(TestPacket {
            ts: TimeVal32::new(t, 0),
            frame: udp_frame([1, 1, 1, 1], [9, 9, 9, 9], 1111, 80, b"xx"),
        });
    }
    for t in times_y {
        packets.push(TestPacket {
            ts: TimeVal32::new(t, 0),
            frame: udp_frame([2, 2, 2, 2], [9, 9, 9, 9], 2222, 80, b"yy"),
        });
    }
    // Arrival order is by timestamp.
    packets.sort_by_key(|p| p.ts);
    let pcap = dir.path().join("order.pcap");
    write_pcap(&pcap, &packets);
    run_capture(&base, &pcap);
    let interval = interval_dir(&base, 0);

    let descr = SearchDescriptor::parse(
        "DSTPORT web 80 80\nAND a 0\nOR o\nFULL res 0\n",
    )
    .unwrap();
    run_search(&descr, &search_opts(&base).with_fetch_pcap(true)).unwrap();

    let mut rdr = PcapReader::open(&interval.join("res.pcap")).unwrap();
    let mut buf = Vec::new();
    let mut seconds = Vec::new();
    while let Some(hdr) = rdr.next_packet(&mut buf).unwrap() {
        seconds.push(hdr.ts.sec);
    }
    assert_eq!(seconds, vec![1, 2, 3, 4, 5, 6]);

    // Total packet count equals the exponent-adjusted sum of the selected
    // flow records.
    let flows = read_flow_set(&interval.join("res.flows"));
    let expected: u64 = flows.iter().map(|r| r.key.decoded_packets()).sum();
    assert_eq!(seconds.len() as u64, expected);
}
