//! Channel names used by the resize node.
//!
//! Channels are addressed as slash-separated paths (`/wide_stereo/resize`).
//! Kafka does not allow `/` in topic names, so the transport maps each path
//! onto a dotted topic name with [`kafka_topic`].

/// Namespace every channel of this node lives under.
pub const ROOT_NAMESPACE: &str = "wide_stereo";

/// Camera stream the node subscribes to, relative to [`ROOT_NAMESPACE`].
pub const INPUT_CHANNEL: &str = "right/image_color";

/// Logical name of the downscaled output channel.
pub const OUTPUT_CHANNEL: &str = "resize";

/// Build the fully-qualified path `/<namespace>/<name>`.
pub fn qualify(namespace: &str, name: &str) -> String {
    format!(
        "/{}/{}",
        namespace.trim_matches('/'),
        name.trim_start_matches('/')
    )
}

/// Map a channel path onto a legal Kafka topic name.
/// e.g. "/wide_stereo/right/image_color" -> "wide_stereo.right.image_color"
pub fn kafka_topic(channel: &str) -> String {
    channel.trim_start_matches('/').replace('/', ".")
}

/// Fully-qualified path of the input channel.
pub fn input_channel() -> String {
    qualify(ROOT_NAMESPACE, INPUT_CHANNEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualify_prefixes_namespace() {
        assert_eq!(qualify(ROOT_NAMESPACE, OUTPUT_CHANNEL), "/wide_stereo/resize");
        assert_eq!(qualify("/wide_stereo/", "/resize"), "/wide_stereo/resize");
    }

    #[test]
    fn input_channel_path() {
        assert_eq!(input_channel(), "/wide_stereo/right/image_color");
    }

    #[test]
    fn kafka_topic_is_dotted() {
        assert_eq!(kafka_topic("/wide_stereo/resize"), "wide_stereo.resize");
        assert_eq!(
            kafka_topic(&input_channel()),
            "wide_stereo.right.image_color"
        );
    }
}
