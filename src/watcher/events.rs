//! Сырые уведомления источника событий и их получение из `notify`.
//!
//! Эти типы не зависят от HTTP и очереди. Преобразование в
//! [`EventRecord`](crate::payload::EventRecord) происходит в `payload.rs`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use glob::{MatchOptions, Pattern};
use notify::event::{MetadataKind, ModifyKind, RenameMode};
use notify::EventKind as NotifyKind;

use crate::error::HookError;
use crate::payload::EventKind;

/// Уведомление от источника событий. Старый путь есть только у `Renamed`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawNotification {
  Created {
    path: PathBuf,
    name: Option<String>,
  },
  Changed {
    path: PathBuf,
    name: Option<String>,
  },
  Deleted {
    path: PathBuf,
    name: Option<String>,
  },
  Renamed {
    path: PathBuf,
    name: Option<String>,
    old_path: PathBuf,
    old_name: Option<String>,
  },
}

impl RawNotification {
  pub fn kind(&self) -> EventKind {
    match self {
      RawNotification::Created { .. } => EventKind::Created,
      RawNotification::Changed { .. } => EventKind::Changed,
      RawNotification::Deleted { .. } => EventKind::Deleted,
      RawNotification::Renamed { .. } => EventKind::Renamed,
    }
  }

  pub fn path(&self) -> &Path {
    match self {
      RawNotification::Created { path, .. }
      | RawNotification::Changed { path, .. }
      | RawNotification::Deleted { path, .. }
      | RawNotification::Renamed { path, .. } => path,
    }
  }

  /// Явное имя от источника, если оно было.
  pub fn name(&self) -> Option<&str> {
    match self {
      RawNotification::Created { name, .. }
      | RawNotification::Changed { name, .. }
      | RawNotification::Deleted { name, .. }
      | RawNotification::Renamed { name, .. } => name.as_deref(),
    }
  }

  fn old_path(&self) -> Option<&Path> {
    match self {
      RawNotification::Renamed { old_path, .. } => Some(old_path),
      _ => None,
    }
  }
}

/// Фильтр по имени файла в духе `*.txt`.
///
/// `*.*` и пустая строка пропускают любое имя, в том числе без расширения.
#[derive(Clone, Debug)]
pub struct NameFilter {
  pattern: Option<Pattern>,
}

impl NameFilter {
  pub fn new(filter: &str) -> Result<Self, HookError> {
    let filter = filter.trim();
    if filter.is_empty() || filter == "*" || filter == "*.*" {
      return Ok(Self { pattern: None });
    }
    Ok(Self {
      pattern: Some(Pattern::new(filter)?),
    })
  }

  pub fn matches_name(&self, name: &str) -> bool {
    let Some(pattern) = &self.pattern else {
      return true;
    };
    let options = MatchOptions {
      case_sensitive: cfg!(not(windows)),
      require_literal_separator: true,
      require_literal_leading_dot: false,
    };
    pattern.matches_with(name, options)
  }

  pub fn matches_path(&self, path: &Path) -> bool {
    path
      .file_name()
      .and_then(|s| s.to_str())
      .is_some_and(|name| self.matches_name(name))
  }

  /// Переименование проходит, если подходит новое или старое имя.
  pub fn matches(&self, raw: &RawNotification) -> bool {
    self.matches_path(raw.path()) || raw.old_path().is_some_and(|p| self.matches_path(p))
  }
}

/// Результат разбора одного события `notify`.
#[derive(Debug)]
pub enum Translated {
  Notifications(Vec<RawNotification>),
  /// Источник потерял события и требует пересканирования.
  Overflow,
}

/// Перевести одно событие `notify` в уведомления четырёх видов.
///
/// Функция не хранит состояния: парное переименование (`RenameMode::Both`)
/// даёт один `Renamed`, а отдельные половины превращаются в `Deleted`
/// (старое имя) и `Created` (новое). Склейку половин в реальном потоке
/// событий делает [`RenamePairer`].
///
/// Изменения только атрибутов (права, владелец, xattr) не считаются `Changed`:
/// учитываются данные, размер и время записи.
pub fn translate_event(event: &notify::Event) -> Translated {
  if event.need_rescan() {
    return Translated::Overflow;
  }

  let paths = &event.paths;
  let each = |make: fn(PathBuf) -> RawNotification| -> Vec<RawNotification> {
    paths.iter().cloned().map(make).collect()
  };

  let out = match &event.kind {
    NotifyKind::Create(_) => each(created),
    NotifyKind::Remove(_) => each(deleted),
    NotifyKind::Modify(ModifyKind::Name(mode)) => match mode {
      RenameMode::Both => match paths.as_slice() {
        [from, to, ..] => vec![renamed(from.clone(), to.clone())],
        [single] => vec![created(single.clone())],
        [] => Vec::new(),
      },
      RenameMode::From => each(deleted),
      RenameMode::To => each(created),
      // Направление неизвестно: смотрим, существует ли путь сейчас.
      RenameMode::Any | RenameMode::Other => paths
        .iter()
        .map(|path| {
          if std::fs::symlink_metadata(path).is_ok() {
            created(path.clone())
          } else {
            deleted(path.clone())
          }
        })
        .collect(),
    },
    NotifyKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime)) => each(changed),
    NotifyKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
    NotifyKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other) => each(changed),
    NotifyKind::Access(_) | NotifyKind::Any | NotifyKind::Other => Vec::new(),
  };

  Translated::Notifications(out)
}

/// Сколько половина переименования ждёт пару, прежде чем считаться
/// перемещением за пределы (или внутрь) наблюдаемого дерева.
pub const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(300);

#[derive(Debug)]
struct PendingFrom {
  tracker: Option<usize>,
  path: PathBuf,
  since: Instant,
}

/// Склеивает половины переименования в один `Renamed`.
///
/// inotify сообщает о переименовании тремя событиями (`From`, `To`, `Both`)
/// с общим tracker'ом, Windows присылает `From` и `To` без tracker'а подряд.
/// На одно переименование получается ровно одно уведомление. `From` без пары
/// по истечении [`RENAME_PAIR_WINDOW`] становится `Deleted`, `To` без пары
/// сразу становится `Created`.
#[derive(Debug, Default)]
pub struct RenamePairer {
  pending: Vec<PendingFrom>,
  /// Tracker'ы, уже выданные как `Renamed`, для подавления хвостового `Both`.
  completed: HashMap<usize, Instant>,
}

impl RenamePairer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Есть ли половины, ожидающие пару.
  pub fn has_pending(&self) -> bool {
    !self.pending.is_empty()
  }

  /// Принять очередное событие `notify`.
  pub fn accept(&mut self, event: &notify::Event, now: Instant) -> Translated {
    if event.need_rescan() {
      return Translated::Overflow;
    }
    let NotifyKind::Modify(ModifyKind::Name(mode)) = &event.kind else {
      return translate_event(event);
    };

    let tracker = event.attrs.tracker();
    match mode {
      RenameMode::From => {
        for path in &event.paths {
          self.pending.push(PendingFrom {
            tracker,
            path: path.clone(),
            since: now,
          });
        }
        Translated::Notifications(Vec::new())
      }
      RenameMode::To => {
        let out = event
          .paths
          .iter()
          .map(|to| match self.take_from(tracker) {
            Some(from) => {
              if let Some(t) = tracker {
                self.completed.insert(t, now);
              }
              renamed(from, to.clone())
            }
            None => created(to.clone()),
          })
          .collect();
        Translated::Notifications(out)
      }
      RenameMode::Both => {
        if let Some(t) = tracker {
          if self.completed.remove(&t).is_some() {
            return Translated::Notifications(Vec::new());
          }
          self.pending.retain(|p| p.tracker != Some(t));
        }
        translate_event(event)
      }
      RenameMode::Any | RenameMode::Other => translate_event(event),
    }
  }

  /// Выдать `Deleted` для половин, не дождавшихся пары к моменту `now`.
  pub fn expire(&mut self, now: Instant) -> Vec<RawNotification> {
    self
      .completed
      .retain(|_, at| now.saturating_duration_since(*at) < RENAME_PAIR_WINDOW);

    let (stale, fresh): (Vec<_>, Vec<_>) = self
      .pending
      .drain(..)
      .partition(|p| now.saturating_duration_since(p.since) >= RENAME_PAIR_WINDOW);
    self.pending = fresh;
    stale.into_iter().map(|p| deleted(p.path)).collect()
  }

  /// Выдать все ожидающие половины как `Deleted` (при остановке источника).
  pub fn drain(&mut self) -> Vec<RawNotification> {
    self.completed.clear();
    self.pending.drain(..).map(|p| deleted(p.path)).collect()
  }

  fn take_from(&mut self, tracker: Option<usize>) -> Option<PathBuf> {
    let idx = self.pending.iter().position(|p| p.tracker == tracker)?;
    Some(self.pending.remove(idx).path)
  }
}

fn renamed(from: PathBuf, to: PathBuf) -> RawNotification {
  RawNotification::Renamed {
    path: to,
    name: None,
    old_path: from,
    old_name: None,
  }
}

fn created(path: PathBuf) -> RawNotification {
  RawNotification::Created { path, name: None }
}

fn changed(path: PathBuf) -> RawNotification {
  RawNotification::Changed { path, name: None }
}

fn deleted(path: PathBuf) -> RawNotification {
  RawNotification::Deleted { path, name: None }
}

#[cfg(test)]
mod tests {
  use super::*;
  use notify::event::{CreateKind, DataChange, Flag, RemoveKind};
  use notify::Event;

  fn notifications(event: &Event) -> Vec<RawNotification> {
    match translate_event(event) {
      Translated::Notifications(n) => n,
      Translated::Overflow => panic!("unexpected overflow"),
    }
  }

  #[test]
  fn test_create_modify_remove_map_to_kinds() {
    let create = Event::new(NotifyKind::Create(CreateKind::File)).add_path("/w/a.txt".into());
    let modify = Event::new(NotifyKind::Modify(ModifyKind::Data(DataChange::Content)))
      .add_path("/w/a.txt".into());
    let remove = Event::new(NotifyKind::Remove(RemoveKind::File)).add_path("/w/a.txt".into());

    assert_eq!(notifications(&create)[0].kind(), EventKind::Created);
    assert_eq!(notifications(&modify)[0].kind(), EventKind::Changed);
    assert_eq!(notifications(&remove)[0].kind(), EventKind::Deleted);
  }

  #[test]
  fn test_rename_pair_becomes_single_renamed() {
    let event = Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)))
      .add_path("/w/old.txt".into())
      .add_path("/w/new.txt".into());

    let out = notifications(&event);
    assert_eq!(
      out,
      vec![RawNotification::Renamed {
        path: PathBuf::from("/w/new.txt"),
        name: None,
        old_path: PathBuf::from("/w/old.txt"),
        old_name: None,
      }]
    );
  }

  #[test]
  fn test_unpaired_rename_halves_degrade() {
    let from = Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::From)))
      .add_path("/w/gone.txt".into());
    let to = Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::To)))
      .add_path("/w/here.txt".into());

    assert_eq!(notifications(&from)[0].kind(), EventKind::Deleted);
    assert_eq!(notifications(&to)[0].kind(), EventKind::Created);
  }

  #[test]
  fn test_attribute_only_changes_are_ignored() {
    for kind in [MetadataKind::Permissions, MetadataKind::Ownership, MetadataKind::Extended, MetadataKind::Any] {
      let event = Event::new(NotifyKind::Modify(ModifyKind::Metadata(kind))).add_path("/w/a.txt".into());
      assert!(notifications(&event).is_empty(), "{kind:?} must not produce Changed");
    }
  }

  #[test]
  fn test_write_time_and_size_changes_are_changed() {
    let write_time = Event::new(NotifyKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime)))
      .add_path("/w/a.txt".into());
    let size = Event::new(NotifyKind::Modify(ModifyKind::Data(DataChange::Size))).add_path("/w/a.txt".into());
    let any = Event::new(NotifyKind::Modify(ModifyKind::Any)).add_path("/w/a.txt".into());

    for event in [write_time, size, any] {
      assert_eq!(notifications(&event)[0].kind(), EventKind::Changed);
    }
  }

  fn name_event(mode: RenameMode, path: &str, tracker: Option<usize>) -> Event {
    let event = Event::new(NotifyKind::Modify(ModifyKind::Name(mode))).add_path(path.into());
    match tracker {
      Some(t) => event.set_tracker(t),
      None => event,
    }
  }

  fn accepted(pairer: &mut RenamePairer, event: &Event, now: Instant) -> Vec<RawNotification> {
    match pairer.accept(event, now) {
      Translated::Notifications(n) => n,
      Translated::Overflow => panic!("unexpected overflow"),
    }
  }

  #[test]
  fn test_pairer_turns_inotify_triple_into_one_renamed() {
    let mut pairer = RenamePairer::new();
    let now = Instant::now();
    let both = Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)))
      .add_path("/w/old.txt".into())
      .add_path("/w/new.txt".into())
      .set_tracker(7);

    let mut out = accepted(&mut pairer, &name_event(RenameMode::From, "/w/old.txt", Some(7)), now);
    out.extend(accepted(&mut pairer, &name_event(RenameMode::To, "/w/new.txt", Some(7)), now));
    out.extend(accepted(&mut pairer, &both, now));
    out.extend(pairer.expire(now + RENAME_PAIR_WINDOW * 2));

    assert_eq!(
      out,
      vec![RawNotification::Renamed {
        path: PathBuf::from("/w/new.txt"),
        name: None,
        old_path: PathBuf::from("/w/old.txt"),
        old_name: None,
      }]
    );
    assert!(!pairer.has_pending());
  }

  #[test]
  fn test_pairer_joins_untracked_from_and_to() {
    let mut pairer = RenamePairer::new();
    let now = Instant::now();
    assert!(accepted(&mut pairer, &name_event(RenameMode::From, "/w/a.txt", None), now).is_empty());
    let out = accepted(&mut pairer, &name_event(RenameMode::To, "/w/b.txt", None), now);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind(), EventKind::Renamed);
    assert_eq!(out[0].path(), Path::new("/w/b.txt"));
  }

  #[test]
  fn test_pairer_moved_out_becomes_deleted_after_window() {
    let mut pairer = RenamePairer::new();
    let now = Instant::now();
    assert!(accepted(&mut pairer, &name_event(RenameMode::From, "/w/gone.txt", Some(3)), now).is_empty());

    assert!(pairer.expire(now + RENAME_PAIR_WINDOW / 2).is_empty());
    let out = pairer.expire(now + RENAME_PAIR_WINDOW);
    assert_eq!(
      out,
      vec![RawNotification::Deleted {
        path: PathBuf::from("/w/gone.txt"),
        name: None,
      }]
    );
  }

  #[test]
  fn test_pairer_moved_in_becomes_created() {
    let mut pairer = RenamePairer::new();
    let out = accepted(&mut pairer, &name_event(RenameMode::To, "/w/arrived.txt", Some(9)), Instant::now());
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind(), EventKind::Created);
  }

  #[test]
  fn test_pairer_drain_flushes_pending_as_deleted() {
    let mut pairer = RenamePairer::new();
    accepted(&mut pairer, &name_event(RenameMode::From, "/w/a.txt", Some(1)), Instant::now());
    let out = pairer.drain();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind(), EventKind::Deleted);
    assert!(!pairer.has_pending());
  }

  #[test]
  fn test_pairer_passes_other_kinds_through() {
    let mut pairer = RenamePairer::new();
    let create = Event::new(NotifyKind::Create(CreateKind::File)).add_path("/w/a.txt".into());
    let out = accepted(&mut pairer, &create, Instant::now());
    assert_eq!(out[0].kind(), EventKind::Created);
  }

  #[test]
  fn test_access_events_are_ignored() {
    let event = Event::new(NotifyKind::Access(notify::event::AccessKind::Any))
      .add_path("/w/a.txt".into());
    assert!(notifications(&event).is_empty());
  }

  #[test]
  fn test_rescan_flag_is_overflow() {
    let event = Event::new(NotifyKind::Other).set_flag(Flag::Rescan);
    assert!(matches!(translate_event(&event), Translated::Overflow));
  }

  #[test]
  fn test_filter_star_dot_star_matches_everything() {
    let filter = NameFilter::new("*.*").unwrap();
    assert!(filter.matches_name("README"));
    assert!(filter.matches_name("a.txt"));
    assert!(NameFilter::new("").unwrap().matches_name("anything"));
  }

  #[test]
  fn test_filter_by_extension() {
    let filter = NameFilter::new("*.csv").unwrap();
    assert!(filter.matches_path(Path::new("/w/sub/data.csv")));
    assert!(!filter.matches_path(Path::new("/w/sub/data.txt")));
  }

  #[test]
  fn test_rename_matches_on_either_name() {
    let filter = NameFilter::new("*.tmp").unwrap();
    let raw = RawNotification::Renamed {
      path: PathBuf::from("/w/final.doc"),
      name: None,
      old_path: PathBuf::from("/w/upload.tmp"),
      old_name: None,
    };
    assert!(filter.matches(&raw));
  }
}
