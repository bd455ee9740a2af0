//! Media playlist rewriting.
//!
//! Segment URIs in an upstream playlist point at the control-plane. Players
//! must come back through the relay instead, so each segment URI is replaced
//! with the signed stream URL plus `&segment=<file name>`.

use m3u8_rs::{parse_playlist_res, MediaPlaylist, Playlist};

use crate::error::{Error, Result};
use crate::signing::is_segment_name;

/// Rewrites every segment URI to `{proxy_base}&segment={name}`.
///
/// A URI names a segment when its path (query and fragment ignored) ends in
/// a file name like `seg_01.ts`. URIs already pointing at the relay end in
/// the stream endpoint, so a second pass leaves them as they are.
pub fn rewrite_segments(raw: &[u8], proxy_base: &str) -> Result<String> {
    let mut playlist = match parse_playlist_res(raw) {
        Ok(Playlist::MediaPlaylist(pl)) => pl,
        Ok(Playlist::MasterPlaylist(_)) => {
            return Err(Error::InvalidPlaylist("expected a media playlist".into()))
        }
        Err(_) => return Err(Error::InvalidPlaylist("unparseable m3u8".into())),
    };

    relink(&mut playlist, proxy_base);

    let mut out = Vec::with_capacity(raw.len() + 64 * playlist.segments.len());
    playlist.write_to(&mut out)?;
    String::from_utf8(out).map_err(|e| Error::InvalidPlaylist(e.to_string()))
}

fn relink(playlist: &mut MediaPlaylist, proxy_base: &str) {
    for segment in &mut playlist.segments {
        if let Some(name) = segment_file_name(&segment.uri) {
            segment.uri = format!("{proxy_base}&segment={name}");
        }
    }
}

fn segment_file_name(uri: &str) -> Option<String> {
    let uri = uri.trim();
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let name = path.rsplit('/').next().unwrap_or(path);
    is_segment_name(name).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str =
        "http://relay.local/api/stream?channel_id=42&timestamp=1700000000&signature=abc&hls=1";

    const PLAYLIST: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:4\n\
#EXT-X-MEDIA-SEQUENCE:7\n\
#EXTINF:4.000,\n\
seg1.ts\n\
#EXTINF:4.000,\n\
path/seg2.ts\n";

    fn segment_params(playlist: &str) -> Vec<String> {
        playlist
            .lines()
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| {
                let url = url::Url::parse(l).unwrap();
                url.query_pairs()
                    .find(|(k, _)| k == "segment")
                    .map(|(_, v)| v.into_owned())
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn rewrites_bare_and_nested_segment_uris() {
        let rewritten = rewrite_segments(PLAYLIST.as_bytes(), BASE).unwrap();
        assert!(rewritten.contains(&format!("{BASE}&segment=seg1.ts\n")));
        assert!(rewritten.contains(&format!("{BASE}&segment=seg2.ts\n")));
        assert!(!rewritten.contains("path/"));
        assert!(rewritten.starts_with("#EXTM3U"));
        assert!(rewritten.contains("#EXT-X-MEDIA-SEQUENCE:7"));
        assert!(rewritten.contains("#EXT-X-TARGETDURATION:4"));
    }

    #[test]
    fn rewritten_urls_resolve_back_to_original_segments() {
        let rewritten = rewrite_segments(PLAYLIST.as_bytes(), BASE).unwrap();
        assert_eq!(segment_params(&rewritten), vec!["seg1.ts", "seg2.ts"]);
    }

    #[test]
    fn rewriting_is_idempotent() {
        let once = rewrite_segments(PLAYLIST.as_bytes(), BASE).unwrap();
        let twice = rewrite_segments(once.as_bytes(), BASE).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.matches("&segment=").count(), 2);
    }

    #[test]
    fn query_and_fragment_are_stripped_from_segment_names() {
        let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg9.ts?token=1\n#EXTINF:4.0,\nlive/seg10.ts#t=0\n";
        let rewritten = rewrite_segments(playlist.as_bytes(), BASE).unwrap();
        assert_eq!(segment_params(&rewritten), vec!["seg9.ts", "seg10.ts"]);
        assert!(!rewritten.contains("token=1"));
    }

    #[test]
    fn non_segment_uris_are_left_alone() {
        let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nhttp://cdn/x/evil.ts.php\n";
        let rewritten = rewrite_segments(playlist.as_bytes(), BASE).unwrap();
        assert!(rewritten.contains("http://cdn/x/evil.ts.php\n"));
        assert!(!rewritten.contains("&segment="));
    }

    #[test]
    fn master_and_garbage_bodies_are_rejected() {
        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=128000\nchunklist.m3u8\n";
        assert!(matches!(
            rewrite_segments(master.as_bytes(), BASE),
            Err(Error::InvalidPlaylist(_))
        ));
        assert!(matches!(
            rewrite_segments(b"<html>502 Bad Gateway</html>", BASE),
            Err(Error::InvalidPlaylist(_))
        ));
    }
}
