#![no_main]

use libfuzzer_sys::fuzz_target;
use match_rendezvous::{MatchPayload, MatchState};

fuzz_target!(|data: &[u8]| {
    // Decoding never fails; it collapses to Invalid instead.
    let payload = MatchPayload::decode(Some(data));

    // Invite data is present exactly in the HasInviteData state.
    assert_eq!(
        payload.invite_data().is_some(),
        payload.state() == MatchState::HasInviteData
    );

    // Anything that decoded to a valid state re-encodes to the same payload.
    if payload.state() != MatchState::Invalid {
        assert_eq!(MatchPayload::decode(Some(&payload.encode())), payload);
    }
});
