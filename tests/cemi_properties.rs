//! Property tests for the cEMI and frame codecs.

use knx_link::addressing::{GroupAddress, IndividualAddress, KnxAddress};
use knx_link::protocol::{
    Apci, Body, Cemi, CemiMessageCode, ControlField1, ControlField2, Frame, SequenceCounter, Tpci,
    TunnelingAck, TunnelingRequest,
};
use proptest::prelude::*;

fn group_address() -> impl Strategy<Value = GroupAddress> {
    any::<u16>().prop_map(GroupAddress::from)
}

fn value_apci() -> impl Strategy<Value = Apci> {
    prop_oneof![Just(Apci::GroupValueWrite), Just(Apci::GroupValueResponse)]
}

fn message_code() -> impl Strategy<Value = CemiMessageCode> {
    prop_oneof![
        Just(CemiMessageCode::LDataReq),
        Just(CemiMessageCode::LDataCon),
        Just(CemiMessageCode::LDataInd),
    ]
}

/// Destination of either kind with a matching control field 2
fn addressing() -> impl Strategy<Value = (KnxAddress, ControlField2)> {
    (any::<u16>(), any::<bool>(), 0u8..=7, 0u8..=15).prop_map(|(raw, group, hops, format)| {
        let ctrl2 = ControlField2::new(group, hops, format).unwrap();
        (KnxAddress::from_raw(raw, group), ctrl2)
    })
}

/// Every 10-bit code: named services and unassigned extended codes alike
fn any_apci() -> impl Strategy<Value = Apci> {
    (0u16..0x400).prop_map(Apci::from_code)
}

fn data_tpci() -> impl Strategy<Value = Tpci> {
    prop_oneof![
        Just(Tpci::UnnumberedData),
        (0u8..=15).prop_map(|sequence| Tpci::numbered_data(sequence).unwrap()),
    ]
}

fn control_tpci() -> impl Strategy<Value = Tpci> {
    prop_oneof![
        (0u8..=3).prop_map(|control| Tpci::unnumbered_control(control).unwrap()),
        (0u8..=15, 0u8..=3)
            .prop_map(|(sequence, control)| Tpci::numbered_control(sequence, control).unwrap()),
    ]
}

/// Arbitrary data or control telegram as the builder accepts it
fn any_cemi() -> impl Strategy<Value = Cemi> {
    let data_packet = (data_tpci(), any_apci(), prop::collection::vec(any::<u8>(), 0..=14))
        .prop_map(|(tpci, apci, data)| (tpci, Some((apci, data))));
    let control_packet = control_tpci().prop_map(|tpci| (tpci, None));
    (
        message_code(),
        prop::collection::vec(any::<u8>(), 0..=8),
        any::<u8>(),
        addressing(),
        any::<u16>(),
        prop_oneof![data_packet, control_packet],
    )
        .prop_map(|(code, info, ctrl1, (destination, ctrl2), source, (tpci, payload))| {
            let builder = Cemi::builder(destination)
                .message_code(code)
                .additional_info(&info)
                .control1(ControlField1::from(ctrl1))
                .control2(ctrl2)
                .source(IndividualAddress::from(source));
            let builder = match payload {
                Some((apci, data)) => builder.tpci(tpci).apci(apci).data(&data),
                None => builder.control_packet(tpci),
            };
            builder.build().unwrap()
        })
}

fn encode(cemi: &Cemi) -> Vec<u8> {
    let mut buf = vec![0u8; cemi.encoded_len()];
    let len = cemi.encode(&mut buf).unwrap();
    buf.truncate(len);
    buf
}

proptest! {
    #[test]
    fn test_cemi_roundtrip(cemi in any_cemi()) {
        let bytes = encode(&cemi);
        prop_assert_eq!(bytes.len(), cemi.encoded_len());
        prop_assert_eq!(Cemi::parse(&bytes).unwrap(), cemi);
    }

    #[test]
    fn test_unknown_apci_builds_only_when_unassigned(code in any::<u16>()) {
        let built = Cemi::builder(IndividualAddress::from(0x1105))
            .apci(Apci::Unknown(code))
            .data(&[1, 2])
            .build();
        match built {
            Ok(cemi) => {
                prop_assert_eq!(Apci::from_code(code), Apci::Unknown(code));
                prop_assert_eq!(Cemi::parse(&encode(&cemi)).unwrap(), cemi);
            }
            Err(e) => prop_assert!(e.is_illegal_argument()),
        }
    }

    #[test]
    fn test_group_telegram_roundtrip(
        destination in group_address(),
        source in any::<u16>(),
        apci in value_apci(),
        data in prop::collection::vec(any::<u8>(), 1..=14),
    ) {
        let cemi = Cemi::builder(destination)
            .source(IndividualAddress::from(source))
            .apci(apci)
            .data(&data)
            .build()
            .unwrap();
        let decoded = Cemi::parse(&encode(&cemi)).unwrap();

        prop_assert_eq!(decoded.data(), &data[..]);
        prop_assert_eq!(decoded.destination(), KnxAddress::from(destination));
        prop_assert_eq!(decoded, cemi);
    }

    #[test]
    fn test_npdu_length_matches_trailing_bytes(
        destination in group_address(),
        apci in value_apci(),
        data in prop::collection::vec(any::<u8>(), 1..=14),
    ) {
        let cemi = Cemi::builder(destination).apci(apci).data(&data).build().unwrap();
        let bytes = encode(&cemi);

        // No additional info: NPDU length at 8, TPCI at 9
        let npdu_length = usize::from(bytes[8]);
        prop_assert_eq!(bytes.len(), 10 + npdu_length);
        let inline = data.len() == 1 && data[0] <= 0x3F;
        prop_assert_eq!(npdu_length, if inline { 1 } else { 1 + data.len() });
    }

    #[test]
    fn test_frame_total_length(
        channel_id in any::<u8>(),
        sequence in any::<u8>(),
        destination in group_address(),
        data in prop::collection::vec(any::<u8>(), 1..=14),
    ) {
        let cemi = Cemi::group_write(destination, &data).unwrap();
        let frame = Frame::new(TunnelingRequest::new(channel_id, sequence, cemi));
        let bytes = frame.to_bytes().unwrap();

        prop_assert_eq!(usize::from(u16::from_be_bytes([bytes[4], bytes[5]])), bytes.len());
        let decoded = Frame::decode(&bytes).unwrap();
        prop_assert_eq!(decoded.body().channel_id(), Some(channel_id));
        prop_assert_eq!(decoded.body().sequence(), Some(sequence));
    }

    #[test]
    fn test_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let _ = Frame::decode(&bytes);
        let _ = Cemi::parse(&bytes);
    }

    #[test]
    fn test_ack_header_survives_decoding(
        channel_id in any::<u8>(),
        sequence in any::<u8>(),
        status in any::<u8>(),
    ) {
        let bytes = Frame::new(TunnelingAck::new(channel_id, sequence, status)).to_bytes().unwrap();
        prop_assert_eq!(bytes.len(), 10);
        match Frame::decode(&bytes).unwrap().into_body() {
            Body::TunnelingAck(ack) => {
                prop_assert_eq!(ack.header.channel_id, channel_id);
                prop_assert_eq!(ack.header.sequence, sequence);
                prop_assert_eq!(ack.header.status, status);
            }
            other => prop_assert!(false, "unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_sequence_counter_wraps(steps in 0usize..1024) {
        let counter = SequenceCounter::new();
        for _ in 0..steps {
            counter.next();
        }
        prop_assert_eq!(usize::from(counter.peek()), steps % 256);
    }
}
