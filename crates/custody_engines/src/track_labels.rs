#![forbid(unsafe_code)]

use custody_contracts::track::{Locale, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackLabels {
    pub title: &'static str,
    pub complete_ack: &'static str,
}

/// Outcome classes that the submitter must see spelled out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKey {
    Delivered,
    Queued,
    InvalidInput,
    DigestUnavailable,
    ServerRejected,
    IntegrityFailure,
    QueueUnavailable,
    AllComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notice {
    pub status: &'static str,
    pub next_action: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptHeadings {
    pub title: &'static str,
    pub submission_id: &'static str,
    pub fingerprint: &'static str,
    pub recorded_at: &'static str,
    pub created_at: &'static str,
    pub descriptor: &'static str,
    pub admission: &'static str,
    pub verify_file: &'static str,
    pub verify_text: &'static str,
}

const TRACK_LABELS: &[(TrackKind, Locale, TrackLabels)] = &[
    (
        TrackKind::Testimony,
        Locale::En,
        TrackLabels {
            title: "Witness testimony",
            complete_ack: "Your testimony step is finished.",
        },
    ),
    (
        TrackKind::Testimony,
        Locale::Uk,
        TrackLabels {
            title: "Свідчення очевидця",
            complete_ack: "Крок зі свідченням завершено.",
        },
    ),
    (
        TrackKind::Physical,
        Locale::En,
        TrackLabels {
            title: "Physical evidence notice",
            complete_ack: "Your physical evidence notice step is finished.",
        },
    ),
    (
        TrackKind::Physical,
        Locale::Uk,
        TrackLabels {
            title: "Повідомлення про речові докази",
            complete_ack: "Крок із речовими доказами завершено.",
        },
    ),
    (
        TrackKind::Digital,
        Locale::En,
        TrackLabels {
            title: "Digital files",
            complete_ack: "Your file upload step is finished.",
        },
    ),
    (
        TrackKind::Digital,
        Locale::Uk,
        TrackLabels {
            title: "Цифрові файли",
            complete_ack: "Крок із завантаженням файлів завершено.",
        },
    ),
    (
        TrackKind::DirectContact,
        Locale::En,
        TrackLabels {
            title: "Direct contact request",
            complete_ack: "Your contact request step is finished.",
        },
    ),
    (
        TrackKind::DirectContact,
        Locale::Uk,
        TrackLabels {
            title: "Запит на прямий контакт",
            complete_ack: "Крок із запитом на контакт завершено.",
        },
    ),
];

const NOTICES: &[(NoticeKey, Locale, Notice)] = &[
    (
        NoticeKey::Delivered,
        Locale::En,
        Notice {
            status: "Submitted and recorded.",
            next_action: "Save your receipt; it lets you verify this evidence later.",
        },
    ),
    (
        NoticeKey::Delivered,
        Locale::Uk,
        Notice {
            status: "Надіслано та зареєстровано.",
            next_action: "Збережіть квитанцію: вона дозволить перевірити ці докази пізніше.",
        },
    ),
    (
        NoticeKey::Queued,
        Locale::En,
        Notice {
            status: "Saved on this device and queued for sending.",
            next_action: "Keep this device; it will send automatically when a connection returns.",
        },
    ),
    (
        NoticeKey::Queued,
        Locale::Uk,
        Notice {
            status: "Збережено на цьому пристрої та поставлено в чергу на надсилання.",
            next_action: "Не видаляйте дані: надсилання відбудеться автоматично після відновлення зв'язку.",
        },
    ),
    (
        NoticeKey::InvalidInput,
        Locale::En,
        Notice {
            status: "Some of the information could not be accepted.",
            next_action: "Correct the highlighted fields and submit again.",
        },
    ),
    (
        NoticeKey::InvalidInput,
        Locale::Uk,
        Notice {
            status: "Частину інформації не вдалося прийняти.",
            next_action: "Виправте позначені поля та надішліть ще раз.",
        },
    ),
    (
        NoticeKey::DigestUnavailable,
        Locale::En,
        Notice {
            status: "This device cannot compute a secure fingerprint.",
            next_action: "Retry on an up-to-date browser or another device.",
        },
    ),
    (
        NoticeKey::DigestUnavailable,
        Locale::Uk,
        Notice {
            status: "Цей пристрій не може обчислити захищений відбиток.",
            next_action: "Спробуйте в оновленому браузері або на іншому пристрої.",
        },
    ),
    (
        NoticeKey::ServerRejected,
        Locale::En,
        Notice {
            status: "The evidence service refused this submission.",
            next_action: "Use the manual channel listed on the contact page to send it.",
        },
    ),
    (
        NoticeKey::ServerRejected,
        Locale::Uk,
        Notice {
            status: "Сервіс доказів відхилив це подання.",
            next_action: "Надішліть його через ручний канал, зазначений на сторінці контактів.",
        },
    ),
    (
        NoticeKey::IntegrityFailure,
        Locale::En,
        Notice {
            status: "The recorded fingerprint does not match what was sent. Submission halted.",
            next_action: "Do not discard the original material; contact the team through the manual channel.",
        },
    ),
    (
        NoticeKey::IntegrityFailure,
        Locale::Uk,
        Notice {
            status: "Зареєстрований відбиток не збігається з надісланим. Подання зупинено.",
            next_action: "Не видаляйте оригінальні матеріали; зв'яжіться з командою через ручний канал.",
        },
    ),
    (
        NoticeKey::QueueUnavailable,
        Locale::En,
        Notice {
            status: "Sending failed and this device could not store the submission.",
            next_action: "Free some storage space and submit again.",
        },
    ),
    (
        NoticeKey::QueueUnavailable,
        Locale::Uk,
        Notice {
            status: "Надсилання не вдалося, і пристрій не зміг зберегти подання.",
            next_action: "Звільніть місце на пристрої та надішліть ще раз.",
        },
    ),
    (
        NoticeKey::AllComplete,
        Locale::En,
        Notice {
            status: "All selected steps are complete. Thank you.",
            next_action: "You may close this page.",
        },
    ),
    (
        NoticeKey::AllComplete,
        Locale::Uk,
        Notice {
            status: "Усі обрані кроки завершено. Дякуємо.",
            next_action: "Цю сторінку можна закрити.",
        },
    ),
];

const RECEIPT_HEADINGS: &[(Locale, ReceiptHeadings)] = &[
    (
        Locale::En,
        ReceiptHeadings {
            title: "EVIDENCE SUBMISSION RECEIPT",
            submission_id: "Submission ID",
            fingerprint: "SHA-256 fingerprint",
            recorded_at: "Recorded (UTC)",
            created_at: "Created (UTC)",
            descriptor: "Evidence",
            admission: "Admission check",
            verify_file: "To verify: run `sha256sum` on your original file and compare with the fingerprint above.",
            verify_text: "To verify: run `custody fingerprint-text` with the same statement and fields and compare with the fingerprint above.",
        },
    ),
    (
        Locale::Uk,
        ReceiptHeadings {
            title: "КВИТАНЦІЯ ПРО ПОДАННЯ ДОКАЗІВ",
            submission_id: "Ідентифікатор подання",
            fingerprint: "Відбиток SHA-256",
            recorded_at: "Зареєстровано (UTC)",
            created_at: "Створено (UTC)",
            descriptor: "Докази",
            admission: "Перевірка допуску",
            verify_file: "Для перевірки: виконайте `sha256sum` для оригінального файлу та порівняйте з відбитком вище.",
            verify_text: "Для перевірки: виконайте `custody fingerprint-text` з тим самим текстом і полями та порівняйте з відбитком вище.",
        },
    ),
];

pub fn track_labels(kind: TrackKind, locale: Locale) -> TrackLabels {
    TRACK_LABELS
        .iter()
        .find(|(k, l, _)| *k == kind && *l == locale)
        .or_else(|| {
            TRACK_LABELS
                .iter()
                .find(|(k, l, _)| *k == kind && *l == Locale::En)
        })
        .map(|(_, _, labels)| *labels)
        .unwrap_or(TrackLabels {
            title: kind.as_str(),
            complete_ack: "",
        })
}

pub fn notice(key: NoticeKey, locale: Locale) -> Notice {
    NOTICES
        .iter()
        .find(|(k, l, _)| *k == key && *l == locale)
        .or_else(|| NOTICES.iter().find(|(k, l, _)| *k == key && *l == Locale::En))
        .map(|(_, _, n)| *n)
        .unwrap_or(Notice {
            status: "",
            next_action: "",
        })
}

pub fn receipt_headings(locale: Locale) -> ReceiptHeadings {
    RECEIPT_HEADINGS
        .iter()
        .find(|(l, _)| *l == locale)
        .unwrap_or(&RECEIPT_HEADINGS[0])
        .1
}
