//! Task trait - 型付き Task の定義

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::TaskKind;

/// Binds a payload type to its kind string.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Notify {
///     chat_id: String,
///     text: String,
/// }
///
/// impl Task for Notify {
///     const KIND: &'static str = "notify";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: submit 時に payload へ変換するため
/// - `DeserializeOwned`: worker 側で payload から復元するため
/// - `Send + Sync + 'static`: spawn された handler に渡すため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 命名規約: `{domain}.{action}` か単語一つ、必要なら `.v{major}`
    const KIND: &'static str;

    fn kind() -> TaskKind {
        TaskKind::new(Self::KIND)
    }
}
