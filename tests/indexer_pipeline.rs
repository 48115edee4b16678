#[path = "common/mod.rs"]
mod common;

use common::*;
use flowcap::{KeyType, PcapReader, TimeVal32};

/// 5,000 UDP packets where srcport = dstport = src-low-byte = (i % 20)+1:
/// exactly 20 flows of 250 packets each.
fn synthetic_corpus(dir: &std::path::Path) -> std::path::PathBuf {
    let mut packets = Vec::new();
    for i in 0..5000u32 {
        let v = (i % 20) as u8 + 1;
        let port = v as u16;
        packets.push(TestPacket {
            ts: TimeVal32::new(1_600_000_000 + i / 100, (i % 100) * 10_000),
            frame: udp_frame([10, 0, 0, v], [192, 168, 0, 1], port, port, b"xy"),
        });
    }
    let pcap = dir.join("synthetic.pcap");
    write_pcap(&pcap, &packets);
    pcap
}

#[test]
fn pipeline_builds_twenty_flows_from_five_thousand_packets() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("data");
    let pcap = synthetic_corpus(dir.path());

    let report = run_capture(&base, &pcap);
    assert_eq!(report.chains_committed, 1);
    assert_eq!(report.packets_captured, 5000);
    assert_eq!(report.packets_dropped, 0);

    let interval = interval_dir(&base, 0);
    assert!(interval.is_dir());

    // The flow index carries one record per flow, each 250 packets.
    let (flow_hdr, flows) = read_flow_index(&interval.join("FLOW"));
    assert_eq!(flow_hdr.records, 20);
    assert!(!flow_hdr.offset64);
    let mut total_packets = 0u64;
    for (_, key, _) in &flows {
        assert_eq!(key.decoded_packets(), 250);
        assert_eq!(key.proto, 17);
        assert_eq!(key.srcport, key.dstport);
        total_packets += key.decoded_packets();
    }
    assert_eq!(total_packets, 5000);

    // Flow records are serialized in comparator order: srcport ascending
    // here.
    let ports: Vec<u16> = flows.iter().map(|(_, k, _)| k.srcport).collect();
    let mut sorted = ports.clone();
    sorted.sort_unstable();
    assert_eq!(ports, sorted);

    // Each applicable projection holds one entry per flow.
    for kt in [KeyType::SrcV4, KeyType::DstV4, KeyType::SrcPort, KeyType::DstPort] {
        let (hdr, entries) = read_projection_index(&interval.join(kt.name()));
        assert_eq!(hdr.records, 20, "{kt}");
        assert_eq!(hdr.preview, 0, "{kt}: too few records for a preview");
        // Keys ascend; entry offsets reference real flow records.
        for pair in entries.windows(2) {
            assert!(pair[0].0 <= pair[1].0, "{kt} keys out of order");
        }
        for (_, off) in &entries {
            assert!(flows.iter().any(|(rec_off, _, _)| rec_off == off), "{kt}");
        }
    }
    // No v6 traffic: the v6 projections exist but are empty.
    for kt in [KeyType::SrcV6, KeyType::DstV6] {
        let (hdr, entries) = read_projection_index(&interval.join(kt.name()));
        assert_eq!(hdr.records, 0, "{kt}");
        assert!(entries.is_empty());
    }

    // The capture file header repurposes sigfigs as the packet count, and
    // the FCAP symlink reaches it.
    let fcap = PcapReader::open(&interval.join("FCAP")).unwrap();
    assert_eq!(fcap.sigfigs, 5000);

    // Stats become visible once the chain commits.
    let catalog: serde_json::Value =
        serde_json::from_slice(&std::fs::read(base.join("catalog.json")).unwrap()).unwrap();
    let row = &catalog["indexes"][0];
    assert_eq!(row["ready"], true);
    assert_eq!(row["stats"]["captured_pkts"], 5000);
    assert_eq!(row["stats"]["ipv4"], 5000);
}

#[test]
fn fcap_groups_each_flow_contiguously() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("data");

    // Interleaved arrivals for two flows.
    let mut packets = Vec::new();
    for i in 0..10u32 {
        let v = (i % 2) as u8 + 1;
        packets.push(TestPacket {
            ts: TimeVal32::new(100 + i, 0),
            frame: udp_frame([10, 0, 0, v], [10, 0, 0, 99], 1000 + v as u16, 53, b"pp"),
        });
    }
    let pcap = dir.path().join("two_flows.pcap");
    write_pcap(&pcap, &packets);
    run_capture(&base, &pcap);

    let interval = interval_dir(&base, 0);
    let mut rdr = PcapReader::open(&interval.join("FCAP")).unwrap();
    let mut buf = Vec::new();
    let mut seen_seconds = Vec::new();
    while let Some(hdr) = rdr.next_packet(&mut buf).unwrap() {
        seen_seconds.push(hdr.ts.sec);
    }
    assert_eq!(seen_seconds.len(), 10);
    // Flow-grouped, not time-ordered: each flow's five packets appear
    // back to back, in arrival order within the flow.
    assert_eq!(
        seen_seconds,
        vec![100, 102, 104, 106, 108, 101, 103, 105, 107, 109]
    );
}
